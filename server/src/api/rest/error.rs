//! Error handling for REST API
//!
//! Every failure is rendered as the `{status: "failed", message}` envelope,
//! except `416` which carries only `Content-Range`.

use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use super::types::ApiResponse;
use crate::storage::TransferError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// Carries the file size for `Content-Range: bytes */<size>`.
    RangeNotSatisfiable(u64),
    /// The client went away mid-transfer.
    Interrupted(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::RangeNotSatisfiable(size) => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                )
                    .into_response();
            }
            AppError::Interrupted(msg) => {
                tracing::info!(reason = %msg, "client disconnected mid-transfer");
                (StatusCode::BAD_REQUEST, format!("Transfer interrupted: {msg}"))
            }
            AppError::Internal(msg) => {
                tracing::error!(details = %msg, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(ApiResponse::<()>::failed(message))).into_response()
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::OutOfBounds(_) => AppError::BadRequest(err.to_string()),
            TransferError::MalformedRequest(msg) => AppError::BadRequest(msg),
            TransferError::NotFound(_) => AppError::NotFound(err.to_string()),
            TransferError::Conflict(_) => AppError::Conflict("File already exists".into()),
            TransferError::RangeNotSatisfiable { size } => AppError::RangeNotSatisfiable(size),
            TransferError::Io(e) => AppError::Internal(format!("Failed to handle file: {e}")),
            TransferError::Interrupted(e) => AppError::Interrupted(e.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: AppError) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, headers, json)
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (TransferError::OutOfBounds("../x".into()), StatusCode::BAD_REQUEST),
            (TransferError::malformed("No filename provided"), StatusCode::BAD_REQUEST),
            (TransferError::NotFound("a.txt".into()), StatusCode::NOT_FOUND),
            (TransferError::Conflict("a.txt".into()), StatusCode::CONFLICT),
            (
                TransferError::Io(std::io::Error::other("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                TransferError::Interrupted(std::io::Error::other("reset")),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            let (status, _, json) = render(err.into()).await;
            assert_eq!(status, expected);
            assert_eq!(json["status"], "failed");
            assert!(json["message"].is_string());
        }
    }

    #[tokio::test]
    async fn test_io_message_includes_reason() {
        let err: AppError = TransferError::Io(std::io::Error::other("disk full")).into();
        let (_, _, json) = render(err).await;
        assert_eq!(json["message"], "Failed to handle file: disk full");
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_has_content_range() {
        let err: AppError = TransferError::RangeNotSatisfiable { size: 10_000 }.into();
        let (status, headers, json) = render(err).await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes */10000");
        assert!(json.is_null());
    }
}
