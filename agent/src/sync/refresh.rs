//! Full collection fetches.

use shopsync_engine::EntityType;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::{now_ms, AppState};

/// Re-fetch every collection from the backend. Entities with unsynced
/// local operations keep their local version.
///
/// Returns the number of collections refreshed; stops at the first
/// transient failure.
pub async fn refresh_all(state: &AppState) -> usize {
    let mut refreshed = 0;

    for entity_type in EntityType::ALL {
        let rows = match state.backend.select(entity_type.table()).await {
            Ok(rows) => rows,
            Err(e @ BackendError::Transient(_)) => {
                warn!(%entity_type, error = %e, "refresh interrupted");
                break;
            }
            Err(e) => {
                warn!(%entity_type, error = %e, "cannot fetch collection");
                continue;
            }
        };

        let mut engine = state.engine.lock().await;
        match engine.refresh(entity_type, rows, now_ms()) {
            Ok(count) => {
                debug!(%entity_type, count, "collection refreshed");
                refreshed += 1;
            }
            Err(e) => warn!(%entity_type, error = %e, "discarding unreadable collection fetch"),
        }
        state.publish(&mut engine);
    }

    refreshed
}
