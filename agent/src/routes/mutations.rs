//! Mutation endpoint.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use shopsync_engine::{Entity, Mutation};

use crate::error::Result;
use crate::handlers::handle_mutation;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/mutations", post(mutate))
}

/// POST /mutations - apply an intent; responds with the optimistic entity.
async fn mutate(
    State(state): State<AppState>,
    Json(mutation): Json<Mutation>,
) -> Result<(StatusCode, Json<Entity>)> {
    let entity = handle_mutation(&state, mutation).await?;
    Ok((StatusCode::ACCEPTED, Json(entity)))
}
