//! Historical backfill endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use super::ApiResult;
use crate::AppState;
use crate::backfill::{BackfillRequest, CollectionSnapshot};
use crate::domain::HistoricalCollection;

/// Create the collections router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/collections", post(start_collection).get(list_collections))
        .route("/v1/collections/{id}", get(get_collection))
        .route("/v1/collections/{id}/pause", post(pause_collection))
        .route("/v1/collections/{id}/resume", post(resume_collection))
        .route("/v1/collections/{id}/cancel", post(cancel_collection))
        .route("/v1/collections/{id}/retry", post(retry_collection))
}

/// `POST /v1/collections`
async fn start_collection(
    State(state): State<AppState>,
    Json(req): Json<BackfillRequest>,
) -> ApiResult<impl IntoResponse> {
    let collection = state.backfill.start(req).await?;
    Ok((StatusCode::ACCEPTED, Json(collection)))
}

/// `GET /v1/collections`
async fn list_collections(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<HistoricalCollection>>> {
    Ok(Json(state.store.list_collections().await?))
}

/// Collection, unit tally and every unit.
///
/// `GET /v1/collections/{id}`
async fn get_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CollectionSnapshot>> {
    Ok(Json(state.backfill.status(&id).await?))
}

async fn pause_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<HistoricalCollection>> {
    Ok(Json(state.backfill.pause(&id).await?))
}

async fn resume_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<HistoricalCollection>> {
    Ok(Json(state.backfill.resume(&id).await?))
}

async fn cancel_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<HistoricalCollection>> {
    Ok(Json(state.backfill.cancel(&id).await?))
}

async fn retry_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<HistoricalCollection>> {
    Ok(Json(state.backfill.retry_failed(&id).await?))
}
