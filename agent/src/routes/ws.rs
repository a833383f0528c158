//! WebSocket upgrade endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::handlers::handle_websocket_connection;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Client label used in logs, e.g. `dashboard`
    #[serde(default)]
    pub client: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

/// GET /ws - stream engine events and cache changes.
async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let client = query.client.unwrap_or_else(|| "ui".to_string());
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, client))
}
