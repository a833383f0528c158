//! Draining the pending queue.
//!
//! A drain pass repeatedly takes the ready operations (at most
//! `DRAIN_CONCURRENCY`, never two touching the same entity), performs
//! their remote steps concurrently and records each outcome. The pass ends
//! when nothing is ready, when an operation had to be requeued, or when
//! connectivity is lost; requeued work waits for the next pass.

use futures::future::join_all;
use shopsync_engine::{RemoteOutcome, StepResult, SyncStep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend;
use crate::{now_ms, AppState};

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Returned to the queue untouched because connectivity dropped
    pub released: usize,
    /// Live operations still queued afterwards
    pub remaining: usize,
}

impl DrainReport {
    fn attempted(&self) -> usize {
        self.completed + self.requeued + self.dead_lettered + self.released
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    Completed,
    Requeued,
    DeadLettered,
    Released,
}

/// Run drain passes whenever woken until cancelled.
pub async fn run(state: AppState, cancel: CancellationToken) {
    // Operations left over from a previous run
    state.request_drain();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = state.drain.notified() => {}
        }
        let report = drain_once(&state).await;
        if report.attempted() > 0 {
            info!(
                completed = report.completed,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                remaining = report.remaining,
                "drain pass done"
            );
        }
    }
    debug!("drain loop stopped");
}

/// One drain pass. Does nothing while offline.
pub async fn drain_once(state: &AppState) -> DrainReport {
    let limit = state.config.drain_concurrency.max(1);
    let mut report = DrainReport::default();

    loop {
        let steps = start_ready(state, limit, &mut report).await;
        if steps.is_empty() {
            break;
        }

        let finished = join_all(steps.into_iter().map(|step| sync_operation(state, step))).await;
        let mut stop = false;
        for outcome in finished.into_iter().flatten() {
            match outcome {
                Finished::Completed => report.completed += 1,
                Finished::DeadLettered => report.dead_lettered += 1,
                Finished::Requeued => {
                    report.requeued += 1;
                    stop = true;
                }
                Finished::Released => {
                    report.released += 1;
                    stop = true;
                }
            }
        }
        if stop {
            break;
        }
    }

    if report.attempted() > 0 {
        let mut engine = state.engine.lock().await;
        report.remaining = engine.finish_drain(report.completed);
        state.publish(&mut engine);
    }
    report
}

/// Mark the next ready operations in flight and plan their first steps.
async fn start_ready(state: &AppState, limit: usize, report: &mut DrainReport) -> Vec<SyncStep> {
    let mut engine = state.engine.lock().await;
    let mut steps = Vec::new();

    for op_id in engine.ready_operations(limit) {
        match engine.start(&op_id, now_ms()) {
            Ok(step) => steps.push(step),
            Err(e) => {
                // Unplannable operations are dead-lettered by the engine
                warn!(%op_id, error = %e, "cannot start operation");
                report.dead_lettered += 1;
            }
        }
    }
    state.publish(&mut engine);
    steps
}

/// Carry one operation through its remote steps. `None` means the engine
/// refused to record an outcome.
async fn sync_operation(state: &AppState, mut step: SyncStep) -> Option<Finished> {
    let timeout = state.config.request_timeout();

    loop {
        let outcome = match tokio::time::timeout(timeout, backend::execute(state.backend.as_ref(), &step)).await {
            Ok(outcome) => outcome,
            Err(_) => RemoteOutcome::Transient(format!("request timed out after {timeout:?}")),
        };
        debug!(op_id = %step.op_id, stage = ?step.stage, entity_type = %step.entity_type, ?outcome, "remote step finished");

        let mut engine = state.engine.lock().await;
        let result = engine.record(&step, outcome, now_ms());
        state.publish(&mut engine);

        match result {
            Ok(StepResult::Continue(next)) => {
                if !engine.is_online() {
                    if let Err(e) = engine.release(&next.op_id) {
                        error!(op_id = %next.op_id, error = %e, "cannot release operation");
                    }
                    return Some(Finished::Released);
                }
                step = next;
            }
            Ok(StepResult::Completed) => return Some(Finished::Completed),
            Ok(StepResult::Requeued { attempts }) => {
                debug!(op_id = %step.op_id, attempts, "operation requeued");
                return Some(Finished::Requeued);
            }
            Ok(StepResult::DeadLettered { reason }) => {
                warn!(op_id = %step.op_id, %reason, "operation dead-lettered");
                return Some(Finished::DeadLettered);
            }
            Err(e) => {
                error!(op_id = %step.op_id, error = %e, "cannot record remote outcome");
                if engine.release(&step.op_id).is_ok() {
                    return Some(Finished::Released);
                }
                return None;
            }
        }
    }
}
