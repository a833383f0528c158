//! In-process backend with versioned rows.
//!
//! Every write stamps the row's `updatedAt`, so conditional updates behave
//! like the real backend's. Reachability, per-table rejection and write
//! latency can be set, and every committed write is broadcast as a
//! [`RemoteChange`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use shopsync_engine::{
    entity::{row_id, row_updated_at},
    ChangeEventType, EntityId, EntityType, Fields, RemoteChange, Timestamp,
};
use tokio::sync::broadcast;

use super::{BackendError, RemoteBackend};

const CHANGE_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct MemoryBackend {
    tables: DashMap<String, BTreeMap<EntityId, Fields>>,
    clock: AtomicU64,
    next_id: AtomicU64,
    reachable: AtomicBool,
    /// Table -> rejection reason
    rejected: DashMap<String, String>,
    /// Delay before each write is handled, in milliseconds
    latency_ms: AtomicU64,
    writes: AtomicUsize,
    changes: broadcast::Sender<RemoteChange>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            tables: DashMap::new(),
            clock: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            rejected: DashMap::new(),
            latency_ms: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
            changes,
        }
    }

    /// Store a row without broadcasting it.
    pub fn seed(&self, table: &str, mut row: Fields) -> Fields {
        let id = row_id(&row).unwrap_or_else(|| self.assign_id(&mut row));
        let stamp = self.stamp();
        row.entry("updatedAt").or_insert(Value::from(stamp));
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());
        row
    }

    /// Simulate another device writing a row: merge, stamp and broadcast.
    pub fn write(&self, table: &str, patch: Fields) -> Option<Fields> {
        let id = row_id(&patch)?;
        let (row, event) = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            let event = if rows.contains_key(&id) {
                ChangeEventType::Update
            } else {
                ChangeEventType::Insert
            };
            let row = rows.entry(id).or_default();
            row.extend(patch);
            row.insert("updatedAt".into(), Value::from(self.stamp()));
            (row.clone(), event)
        };
        self.broadcast(table, event, row.clone());
        Some(row)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Fields> {
        self.tables.get(table)?.get(id).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Fields> {
        self.tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every call fail as unreachable, or restore service.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Reject every write to a table as invalid.
    pub fn reject_writes(&self, table: &str, reason: impl Into<String>) {
        self.rejected.insert(table.to_string(), reason.into());
    }

    pub fn accept_writes(&self, table: &str) {
        self.rejected.remove(table);
    }

    /// Hold every write for `latency` before handling it. A write dropped
    /// while waiting never lands.
    pub fn set_write_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Writes committed through the [`RemoteBackend`] interface.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }

    /// Monotonic modification time, at least the wall clock.
    fn stamp(&self) -> Timestamp {
        let now = crate::now_ms();
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn assign_id(&self, row: &mut Fields) -> EntityId {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        row.insert("id".into(), Value::String(id.clone()));
        id
    }

    fn broadcast(&self, table: &str, event_type: ChangeEventType, row: Fields) {
        if let Some(entity_type) = EntityType::from_table(table) {
            // Nobody listening is fine
            let _ = self.changes.send(RemoteChange::new(entity_type, event_type, row));
        }
    }

    fn check(&self, table: &str) -> Result<(), BackendError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("backend unreachable".into()));
        }
        if let Some(reason) = self.rejected.get(table) {
            return Err(BackendError::Validation(reason.clone()));
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn committed(&self, table: &str, event_type: ChangeEventType, row: Fields) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.broadcast(table, event_type, row);
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn select(&self, table: &str) -> Result<Vec<Fields>, BackendError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("backend unreachable".into()));
        }
        Ok(self.rows(table))
    }

    async fn insert(&self, table: &str, mut row: Fields) -> Result<Fields, BackendError> {
        self.delay().await;
        self.check(table)?;
        let row = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            let id = match row_id(&row) {
                Some(id) => id,
                None => self.assign_id(&mut row),
            };
            if let Some(current) = rows.get(&id) {
                return Err(BackendError::Conflict {
                    current: Some(current.clone()),
                });
            }
            row.insert("updatedAt".into(), Value::from(self.stamp()));
            rows.insert(id, row.clone());
            row
        };
        self.committed(table, ChangeEventType::Insert, row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Fields,
        expected_updated_at: Option<Timestamp>,
    ) -> Result<Fields, BackendError> {
        self.delay().await;
        self.check(table)?;
        let row = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            let row = rows.get_mut(id).ok_or(BackendError::NotFound)?;
            if let Some(expected) = expected_updated_at {
                if row_updated_at(row) != Some(expected) {
                    return Err(BackendError::Conflict {
                        current: Some(row.clone()),
                    });
                }
            }
            row.extend(patch);
            row.insert("id".into(), Value::String(id.to_string()));
            row.insert("updatedAt".into(), Value::from(self.stamp()));
            row.clone()
        };
        self.committed(table, ChangeEventType::Update, row.clone());
        Ok(row)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError> {
        self.delay().await;
        self.check(table)?;
        let removed = self
            .tables
            .get_mut(table)
            .and_then(|mut rows| rows.remove(id))
            .ok_or(BackendError::NotFound)?;
        let mut tombstone = Fields::new();
        tombstone.insert("id".into(), removed.get("id").cloned().unwrap_or(Value::from(id)));
        self.committed(table, ChangeEventType::Delete, tombstone);
        Ok(())
    }

    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
