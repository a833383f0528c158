//! Mutation handler - applies UI intents to the engine.

use shopsync_engine::{Entity, Mutation};

use crate::error::Result;
use crate::{now_ms, AppState};

/// Apply a mutation optimistically and wake the drain loop.
///
/// The returned entity already reflects the change; syncing happens in the
/// background whenever the backend is reachable.
pub async fn handle_mutation(state: &AppState, mutation: Mutation) -> Result<Entity> {
    let entity_type = mutation.entity_type;
    let kind = mutation.kind;

    let entity = {
        let mut engine = state.engine.lock().await;
        let result = engine.mutate(mutation, now_ms());
        state.publish(&mut engine);
        result?
    };

    tracing::debug!(
        %entity_type,
        entity_id = %entity.id,
        ?kind,
        "mutation applied"
    );
    state.request_drain();
    Ok(entity)
}
