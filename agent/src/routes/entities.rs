//! Read access to the local cache.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use shopsync_engine::{Entity, EntityStatus, EntityType};

use crate::error::{AppError, Result};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entities/{table}", get(list_entities))
        .route("/entities/{table}/{id}", get(get_entity))
        .route("/entities/{table}/{id}/status", get(entity_status))
}

fn entity_type(table: &str) -> Result<EntityType> {
    EntityType::from_table(table).ok_or_else(|| AppError::NotFound(format!("unknown table '{table}'")))
}

/// GET /entities/{table} - every active entity, optimistic state included.
async fn list_entities(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<Vec<Entity>>> {
    let entity_type = entity_type(&table)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.entities(entity_type)))
}

/// GET /entities/{table}/{id}
async fn get_entity(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<Entity>> {
    let entity_type = entity_type(&table)?;
    let engine = state.engine.lock().await;
    engine
        .entity(entity_type, &id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{table}/{id}")))
}

/// GET /entities/{table}/{id}/status - pending and dead-letter indicators.
async fn entity_status(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<EntityStatus>> {
    let entity_type = entity_type(&table)?;
    let engine = state.engine.lock().await;
    Ok(Json(engine.status(entity_type, &id)))
}
