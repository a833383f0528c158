//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the remote backend is considered reachable
    pub online: bool,
    pub pending: usize,
    pub connections: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (online, pending) = {
        let engine = state.engine.lock().await;
        (engine.is_online(), engine.queue().pending_count())
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        online,
        pending,
        connections: state.conn_manager.connection_count(),
    })
}

async fn root() -> &'static str {
    "Shopsync Agent"
}
