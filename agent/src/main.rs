//! Shopsync Agent - offline-first sync for the shop dashboard.
//!
//! Hosts the engine on local durable storage, syncs it against the remote
//! backend and serves the local API the dashboard talks to.

use std::sync::Arc;

use shopsync_agent::backend::RestBackend;
use shopsync_agent::config::Config;
use shopsync_agent::{build_router, open_engine, spawn_background, AppState};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shopsync_agent=debug,shopsync_engine=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(data_dir = %config.data_dir.display(), "opening local state");
    let engine = open_engine(&config)?;

    let backend = RestBackend::new(
        config.backend_url.clone(),
        config.backend_api_key.clone(),
        config.request_timeout(),
    )?;
    let addr = config.listen_addr();
    let state = AppState::new(engine, Arc::new(backend), config);

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    spawn_background(&state, &tracker, &cancel);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Agent listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for shutdown signal: {}", e);
            }
            shutdown.cancel();
        })
        .await?;

    tracker.close();
    tracker.wait().await;
    tracing::info!("Agent stopped");
    Ok(())
}
