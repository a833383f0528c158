//! Queue inspection and dead-letter handling.

use serde::Serialize;
use shopsync_engine::PendingOperation;

use crate::error::Result;
use crate::AppState;

/// The pending queue as shown to the user.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub online: bool,
    /// Live operations, queued or in flight
    pub pending: usize,
    pub dead_lettered: usize,
    /// Failed writes to durable storage since start
    pub persist_failures: u64,
    /// Every operation in enqueue order
    pub operations: Vec<PendingOperation>,
}

pub async fn handle_queue(state: &AppState) -> QueueResponse {
    let engine = state.engine.lock().await;
    let queue = engine.queue();

    QueueResponse {
        online: engine.is_online(),
        pending: queue.pending_count(),
        dead_lettered: queue.dead_lettered().count(),
        persist_failures: engine.persist_failures(),
        operations: queue.to_vec(),
    }
}

/// Put a dead-lettered operation back in the queue.
pub async fn handle_retry(state: &AppState, op_id: &str) -> Result<()> {
    {
        let mut engine = state.engine.lock().await;
        let result = engine.retry_dead_lettered(op_id);
        state.publish(&mut engine);
        result?;
    }
    state.request_drain();
    Ok(())
}

/// Drop a dead-lettered operation for good, reverting its local effects.
pub async fn handle_discard(state: &AppState, op_id: &str) -> Result<PendingOperation> {
    let mut engine = state.engine.lock().await;
    let result = engine.discard_dead_lettered(op_id);
    state.publish(&mut engine);
    Ok(result?)
}
