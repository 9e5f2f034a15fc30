//! Text pad routes

use crate::api::AppState;
use crate::pad::PadEntry;
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};

use super::error::AppError;
use super::types::{AddTextRequest, ApiResponse};

pub fn text_routes() -> Router<AppState> {
    Router::new()
        .route("/text/list", get(list_text))
        .route("/text/add", post(add_text))
}

async fn list_text(State(state): State<AppState>) -> Json<ApiResponse<Vec<PadEntry>>> {
    Json(ApiResponse::success("Load successfully", Some(state.pad.entries().await)))
}

async fn add_text(
    State(state): State<AppState>,
    payload: Result<Json<AddTextRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    let Json(req) = payload?;
    state
        .pad
        .add(&req.text)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(Json(ApiResponse::success("Saved successfully", None)))
}
