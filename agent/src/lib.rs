//! Shopsync Agent - hosts the offline-first engine next to the dashboard.
//!
//! The agent owns the durable engine state, talks to the remote backend
//! (REST for writes and full fetches, a websocket feed for pushed changes),
//! watches connectivity and drains the pending queue whenever the backend is
//! reachable. The UI layer talks to it over a small local HTTP API and a
//! websocket that streams engine events.

pub mod backend;
pub mod config;
pub mod error;
pub mod handlers;
pub mod monitor;
pub mod realtime;
pub mod routes;
pub mod storage;
pub mod sync;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use shopsync_engine::{Engine, Timestamp};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backend::RemoteBackend;
use crate::config::Config;
use crate::storage::FileStorage;
use crate::websocket::{ConnectionManager, ServerMessage};

/// The engine, shared by the API handlers and the background loops.
pub type SharedEngine = Arc<Mutex<Engine>>;

/// Application state shared across handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub engine: SharedEngine,
    pub backend: Arc<dyn RemoteBackend>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    /// Wakes the drain loop
    pub drain: Arc<Notify>,
}

impl AppState {
    /// Wire an opened engine to a backend. Cache changes are streamed to
    /// websocket clients from here on.
    pub fn new(mut engine: Engine, backend: Arc<dyn RemoteBackend>, config: Config) -> Self {
        let conn_manager = ConnectionManager::new_shared();
        let observers = conn_manager.clone();
        engine.subscribe(move |change| {
            observers.broadcast(ServerMessage::CacheChanged {
                change: change.clone(),
            });
        });

        Self {
            engine: Arc::new(Mutex::new(engine)),
            backend,
            config: Arc::new(config),
            conn_manager,
            drain: Arc::new(Notify::new()),
        }
    }

    /// Forward the engine's accumulated events to connected clients.
    pub fn publish(&self, engine: &mut Engine) -> usize {
        let events = engine.drain_events();
        let count = events.len();
        for event in events {
            tracing::debug!(event = event.name(), "engine event");
            self.conn_manager.broadcast(ServerMessage::Event { event });
        }
        count
    }

    /// Ask the drain loop for a pass.
    pub fn request_drain(&self) {
        self.drain.notify_one();
    }
}

/// Open the engine on the configured data directory.
pub fn open_engine(config: &Config) -> Result<Engine, shopsync_engine::Error> {
    let mut storage = FileStorage::open(config.data_dir.clone())?;
    let node_id = storage::resolve_node_id(&mut storage, config.node_id.as_deref())?;
    Engine::open(config.engine_config(node_id), Box::new(storage))
}

/// Build the local API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the connectivity, drain and realtime loops.
pub fn spawn_background(state: &AppState, tracker: &TaskTracker, cancel: &CancellationToken) {
    tracker.spawn(monitor::run(state.clone(), cancel.clone()));
    tracker.spawn(sync::drain::run(state.clone(), cancel.clone()));

    match &state.config.realtime_url {
        Some(url) => {
            let (tx, rx) = tokio::sync::mpsc::channel(realtime::CHANNEL_CAPACITY);
            let client = realtime::RealtimeClient::new(url.clone());
            tracker.spawn(client.run(tx, cancel.clone()));
            tracker.spawn(realtime::apply_changes(state.clone(), rx, cancel.clone()));
        }
        None => tracing::info!("REALTIME_URL not set, realtime feed disabled"),
    }
}

/// Wall clock in milliseconds since the epoch.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
