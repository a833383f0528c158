//! Pending queue endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use shopsync_engine::PendingOperation;

use crate::error::Result;
use crate::handlers::{handle_discard, handle_queue, handle_retry, QueueResponse};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queue", get(queue))
        .route("/queue/{op_id}/retry", post(retry))
        .route("/queue/{op_id}", delete(discard))
}

/// GET /queue
async fn queue(State(state): State<AppState>) -> Json<QueueResponse> {
    Json(handle_queue(&state).await)
}

/// POST /queue/{op_id}/retry - requeue a dead-lettered operation.
async fn retry(State(state): State<AppState>, Path(op_id): Path<String>) -> Result<StatusCode> {
    handle_retry(&state, &op_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /queue/{op_id} - discard a dead-lettered operation.
async fn discard(
    State(state): State<AppState>,
    Path(op_id): Path<String>,
) -> Result<Json<PendingOperation>> {
    Ok(Json(handle_discard(&state, &op_id).await?))
}
