//! HTTP route definitions.

mod entities;
mod health;
mod mutations;
mod queue;
mod ws;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(entities::routes())
        .merge(mutations::routes())
        .merge(queue::routes())
        .merge(ws::routes())
}
