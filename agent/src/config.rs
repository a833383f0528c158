//! Configuration management for the agent.

use shopsync_engine::{EngineConfig, NodeId};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local API host address
    pub host: String,
    /// Local API port
    pub port: u16,
    /// Base URL of the remote backend (PostgREST style)
    pub backend_url: String,
    pub backend_api_key: Option<String>,
    /// Realtime websocket URL; realtime is disabled when absent
    pub realtime_url: Option<String>,
    /// Directory holding the durable cache, queue and node id
    pub data_dir: PathBuf,
    /// Explicit node id; otherwise one is generated and persisted
    pub node_id: Option<NodeId>,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
    pub online_debounce_ms: u64,
    pub realtime_debounce_ms: u64,
    pub probe_interval_ms: u64,
    /// Operations sent concurrently during a drain
    pub drain_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend_url = var("BACKEND_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or(ConfigError::Missing("BACKEND_URL"))?;

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse(&var, "PORT", 4100)?,
            backend_url,
            backend_api_key: var("BACKEND_API_KEY"),
            realtime_url: var("REALTIME_URL"),
            data_dir: var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./shopsync-data")),
            node_id: var("NODE_ID"),
            max_attempts: parse(&var, "MAX_ATTEMPTS", 5)?,
            request_timeout_ms: parse(&var, "REQUEST_TIMEOUT_MS", 10_000)?,
            online_debounce_ms: parse(&var, "ONLINE_DEBOUNCE_MS", 1_500)?,
            realtime_debounce_ms: parse(&var, "REALTIME_DEBOUNCE_MS", 500)?,
            probe_interval_ms: parse(&var, "PROBE_INTERVAL_MS", 5_000)?,
            drain_concurrency: parse(&var, "DRAIN_CONCURRENCY", 4)?,
        })
    }

    /// Engine settings for the given node.
    pub fn engine_config(&self, node_id: impl Into<NodeId>) -> EngineConfig {
        EngineConfig {
            max_attempts: self.max_attempts,
            online_debounce_ms: self.online_debounce_ms,
            realtime_debounce_ms: self.realtime_debounce_ms,
            ..EngineConfig::new(node_id)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var: name,
            value,
        }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid {var} value: {value:?}")]
    Invalid { var: &'static str, value: String },
}
