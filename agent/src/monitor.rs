//! Connectivity probing.
//!
//! Probes the backend on a fixed interval and feeds the result to the
//! engine's network monitor, which debounces the online transition. Going
//! online refreshes every collection and starts a drain; while online with
//! work outstanding each probe also requests a drain, which is how
//! requeued operations get retried.

use std::time::Duration;

use shopsync_engine::{Timestamp, Transition};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{now_ms, sync, AppState};

pub async fn run(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(state.config.probe_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let due = state.engine.lock().await.online_due_at();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                probe_once(&state).await;
            }
            _ = sleep_until_ms(due) => {
                poll_once(&state).await;
            }
        }
    }
    debug!("connectivity monitor stopped");
}

/// Probe the backend once and act on any resulting transition.
pub async fn probe_once(state: &AppState) -> Option<Transition> {
    let reachable = state.backend.probe().await;
    let (transition, has_work) = {
        let mut engine = state.engine.lock().await;
        let transition = engine.observe_connectivity(reachable, now_ms());
        state.publish(&mut engine);
        (
            transition,
            engine.is_online() && engine.queue().pending_count() > 0,
        )
    };

    after_transition(state, transition).await;
    if has_work && transition.is_none() {
        state.request_drain();
    }
    transition
}

/// Report an online transition whose debounce window has elapsed.
pub async fn poll_once(state: &AppState) -> Option<Transition> {
    let transition = {
        let mut engine = state.engine.lock().await;
        let transition = engine.poll_connectivity(now_ms());
        state.publish(&mut engine);
        transition
    };
    after_transition(state, transition).await;
    transition
}

async fn after_transition(state: &AppState, transition: Option<Transition>) {
    match transition {
        Some(Transition::WentOnline) => {
            info!("backend reachable, syncing");
            let refreshed = sync::refresh_all(state).await;
            debug!(refreshed, "collections refreshed");
            state.request_drain();
        }
        Some(Transition::WentOffline) => {
            info!("backend unreachable, mutations stay queued locally");
        }
        None => {}
    }
}

/// Sleep until a wall-clock deadline, or forever without one.
pub(crate) async fn sleep_until_ms(deadline: Option<Timestamp>) {
    match deadline {
        Some(at) => tokio::time::sleep(Duration::from_millis(at.saturating_sub(now_ms()))).await,
        None => std::future::pending().await,
    }
}
