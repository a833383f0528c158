//! Remote backend access.
//!
//! The engine describes each remote call as a [`SyncStep`]; a
//! [`RemoteBackend`] performs it and the failure is classified into a
//! [`RemoteOutcome`] the engine understands.

mod memory;
mod rest;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use shopsync_engine::{Fields, RemoteOutcome, RemoteRequest, SyncStep, Timestamp};

/// Classified remote failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Connectivity loss, timeout, rate limiting or a server-side failure
    #[error("backend unavailable: {0}")]
    Transient(String),

    /// The payload will never be accepted
    #[error("rejected by backend: {0}")]
    Validation(String),

    /// The row changed remotely since it was last seen
    #[error("write conflicts with a newer remote row")]
    Conflict { current: Option<Fields> },

    #[error("row not found")]
    NotFound,
}

impl From<BackendError> for RemoteOutcome {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Transient(msg) => RemoteOutcome::Transient(msg),
            BackendError::Validation(msg) => RemoteOutcome::Rejected(msg),
            BackendError::Conflict { current } => RemoteOutcome::Conflict(current),
            BackendError::NotFound => RemoteOutcome::NotFound,
        }
    }
}

/// Row-level access to the remote tables.
///
/// Rows cross this boundary in engine form: camelCase keys and
/// millisecond timestamps.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Every row of a table.
    async fn select(&self, table: &str) -> Result<Vec<Fields>, BackendError>;

    /// Insert a row, returning the stored row with its assigned id.
    async fn insert(&self, table: &str, row: Fields) -> Result<Fields, BackendError>;

    /// Patch a row. When `expected_updated_at` is given the write only
    /// lands if the row was not modified since; otherwise it fails with
    /// [`BackendError::Conflict`].
    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Fields,
        expected_updated_at: Option<Timestamp>,
    ) -> Result<Fields, BackendError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError>;

    /// Whether the backend is reachable right now.
    async fn probe(&self) -> bool;
}

/// Perform one sync step.
pub async fn execute(backend: &dyn RemoteBackend, step: &SyncStep) -> RemoteOutcome {
    let table = step.table();
    let result = match &step.request {
        RemoteRequest::Insert { row } => backend.insert(table, row.clone()).await.map(Some),
        RemoteRequest::Update {
            id,
            patch,
            expected_updated_at,
        } => backend
            .update(table, id, patch.clone(), *expected_updated_at)
            .await
            .map(Some),
        RemoteRequest::Delete { id } => backend.delete(table, id).await.map(|()| None),
    };

    match result {
        Ok(row) => RemoteOutcome::Applied(row),
        Err(e) => e.into(),
    }
}

/// Timestamp columns exchanged as RFC 3339 strings on the wire.
const TIMESTAMP_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// `currentStock` -> `current_stock`
pub(crate) fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert an engine row into column form for the wire.
pub fn to_wire(row: Fields) -> Fields {
    row.into_iter()
        .map(|(key, value)| {
            let column = snake_case(&key);
            let value = match (&value, TIMESTAMP_COLUMNS.contains(&column.as_str())) {
                (Value::Number(n), true) => n
                    .as_i64()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|t| Value::String(t.to_rfc3339()))
                    .unwrap_or(value),
                _ => value,
            };
            (column, value)
        })
        .collect()
}

/// Convert a wire row into engine form. Timestamp columns become
/// milliseconds; key casing is left to the engine's normalization.
pub fn from_wire(row: Fields) -> Fields {
    row.into_iter()
        .map(|(key, value)| {
            let value = match &value {
                Value::String(s) if TIMESTAMP_COLUMNS.contains(&snake_case(&key).as_str()) => {
                    DateTime::parse_from_rfc3339(s)
                        .map(|t| Value::from(t.timestamp_millis()))
                        .unwrap_or(value)
                }
                _ => value,
            };
            (key, value)
        })
        .collect()
}

/// Bounds `[start, end)` of the millisecond a row version was read in.
///
/// The backend keeps timestamps to the microsecond while the engine holds
/// milliseconds (`from_wire` floors), so a version is matched by the
/// millisecond it falls in rather than by equality.
pub(crate) fn version_window(ms: Timestamp) -> Option<(String, String)> {
    let start = DateTime::<Utc>::from_timestamp_millis(i64::try_from(ms).ok()?)?;
    let end = start + chrono::Duration::milliseconds(1);
    Some((
        start.to_rfc3339_opts(SecondsFormat::Micros, false),
        end.to_rfc3339_opts(SecondsFormat::Micros, false),
    ))
}
