//! File transfer routes
//!
//! List, check, upload and ranged download over the shared root.

use crate::api::AppState;
use crate::storage::listing::format_modified;
use crate::storage::multipart::{is_multipart, parse_boundary};
use crate::storage::{
    ByteSource, ByteStream, EntryKind, FileBody, StoredFile, TransferError, UploadMetadata,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use tokio_stream::StreamExt;

use super::error::AppError;
use super::types::{ApiResponse, CheckRequest, FileInfo, ListRequest, ListingData};
use super::METADATA_HEADER;

const DOWNLOAD_PREFIXES: [&str; 2] = ["/files/download/", "/file/get/"];

// ============================================================================
// ROUTES
// ============================================================================

pub fn file_routes() -> Router<AppState> {
    Router::new()
        .route("/files/list", post(list_files))
        .route("/files/check", post(check_file))
        .route("/files/add", post(add_file).put(add_file))
        .route("/files/download/*path", get(download_file))
        // Link form used by older web clients.
        .route("/file/get/*path", get(download_file))
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn list_files(
    State(state): State<AppState>,
    payload: Result<Json<ListRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<ListingData>>, AppError> {
    let Json(req) = payload?;
    let dir = state.root.resolve(&req.dirname).await?;
    let listing = state.lister.list(&dir).await;

    let (status, message) = if listing.is_success() {
        ("success", "Files listed successfully")
    } else {
        ("failed", "Error listing files")
    };

    Ok(Json(ApiResponse {
        status,
        message: message.to_string(),
        data: Some(ListingData {
            folder: listing.folder,
            files: listing.entries.into_iter().map(FileInfo::from).collect(),
        }),
    }))
}

async fn check_file(
    State(state): State<AppState>,
    payload: Result<Json<CheckRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    let Json(req) = payload?;
    match state.intake.check(&req.dirname, &req.filename).await {
        Ok(_) => Ok(Json(ApiResponse::success("File can be uploaded", None))),
        Err(TransferError::Conflict(_)) => Ok(Json(ApiResponse::failed("File already exists"))),
        Err(e) => Err(e.into()),
    }
}

/// Multipart bodies are parsed by the upload intake; any other body is the
/// file itself and the target must come from `X-File-Metadata`.
async fn add_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ApiResponse<Vec<FileInfo>>>, AppError> {
    let metadata = match headers.get(METADATA_HEADER) {
        Some(value) => UploadMetadata::from_header(&String::from_utf8_lossy(value.as_bytes()))?,
        None => UploadMetadata::default(),
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let stream: ByteStream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    );

    let source = if is_multipart(content_type) {
        let boundary = parse_boundary(content_type)
            .ok_or_else(|| AppError::BadRequest("Missing multipart boundary".into()))?;
        ByteSource::Multipart {
            boundary,
            body: stream,
        }
    } else {
        ByteSource::Stream(stream)
    };

    let stored = state.intake.receive(metadata, source).await?;
    let info = stored_info(&state, &stored).await;

    Ok(Json(ApiResponse::success("Files uploaded", Some(vec![info]))))
}

/// The path is taken from the raw URI so percent-decoding happens exactly
/// once, inside the resolver. Bodies and metadata are never decoded again.
async fn download_file(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let relative = DOWNLOAD_PREFIXES
        .iter()
        .find_map(|prefix| uri.path().strip_prefix(prefix))
        .unwrap_or_default();
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    let served = state.files.open(relative, range).await?;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, served.content_type.as_str())
        .header(header::CONTENT_LENGTH, served.content_length())
        .header(header::ACCEPT_RANGES, "bytes");

    builder = match served.range {
        Some(window) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, window.content_range(served.size)),
        None => builder.status(StatusCode::OK),
    };

    let body = match served.body {
        FileBody::Stream(stream) => Body::from_stream(stream),
        FileBody::Buffered(bytes) => Body::from(bytes),
    };

    builder
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))
}

async fn stored_info(state: &AppState, stored: &StoredFile) -> FileInfo {
    let upload_time = tokio::fs::metadata(stored.location.absolute())
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .map(|t| format_modified(t, &state.config.date_format));

    FileInfo {
        name: stored.location.file_name().unwrap_or_default().to_string(),
        path: stored.location.relative().to_string(),
        kind: EntryKind::File,
        size: Some(stored.size),
        upload_time,
    }
}
