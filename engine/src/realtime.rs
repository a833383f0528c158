//! Buffering and debouncing of remote change notifications.
//!
//! A change for an entity with queued or in-flight local operations is held
//! back until those operations complete, so a row fetched before the local
//! write landed never overwrites it. Every other change joins the current
//! burst, which is flushed as one batch once the feed has been quiet for the
//! debounce window.

use crate::{
    entity::{row_id, row_updated_at, Entity, EntityKey, EntityType, Fields},
    error::Result,
    Error, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default quiet window before a burst is flushed.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// A burst is flushed after this many windows even if events keep coming.
const MAX_WAIT_WINDOWS: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventType {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

/// One row change pushed by the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub event_type: ChangeEventType,
    /// The new row, or for deletes at least its id
    pub row: Fields,
}

impl RemoteChange {
    pub fn new(entity_type: EntityType, event_type: ChangeEventType, row: Fields) -> Self {
        Self {
            entity_type,
            event_type,
            row,
        }
    }

    pub fn key(&self) -> Result<EntityKey> {
        let id = row_id(&self.row).ok_or_else(|| {
            Error::InvalidPayload(format!("{} change without id", self.entity_type))
        })?;
        Ok(EntityKey::new(self.entity_type, id))
    }

    /// Remote modification time, falling back to the receipt time.
    pub fn updated_at(&self, received_at: Timestamp) -> Timestamp {
        row_updated_at(&self.row).unwrap_or(received_at)
    }
}

#[derive(Debug, Clone)]
struct Received {
    change: RemoteChange,
    at: Timestamp,
}

/// Outcome of merging a remote change into a cached entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Merge {
    Upsert(Entity),
    Remove,
    /// Older than what the cache already confirmed
    Stale,
}

/// Merge a remote change into the current cached entity, if any.
pub(crate) fn merge_remote(current: Option<&Entity>, change: &RemoteChange, at: Timestamp) -> Result<Merge> {
    if change.event_type == ChangeEventType::Delete {
        return Ok(match current {
            Some(_) => Merge::Remove,
            None => Merge::Stale,
        });
    }

    let updated_at = change.updated_at(at);
    match current {
        Some(entity) if entity.confirmed_at().is_some_and(|c| c > updated_at) => Ok(Merge::Stale),
        Some(entity) => {
            let mut entity = entity.clone();
            entity.confirm(change.row.clone(), at);
            Ok(Merge::Upsert(entity))
        }
        None => Entity::from_remote(change.entity_type, change.row.clone(), at).map(Merge::Upsert),
    }
}

/// Buffers remote changes that must wait and debounces the rest.
#[derive(Debug, Clone)]
pub struct ChangeListener {
    window: u64,
    /// Held back until local operations on the entity complete
    held: BTreeMap<EntityKey, Received>,
    /// Current burst, newest change per entity
    burst: BTreeMap<EntityKey, Received>,
    burst_started: Option<Timestamp>,
    last_event: Option<Timestamp>,
}

impl Default for ChangeListener {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_MS)
    }
}

impl ChangeListener {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: window_ms,
            held: BTreeMap::new(),
            burst: BTreeMap::new(),
            burst_started: None,
            last_event: None,
        }
    }

    /// Accept a change. `pending` says whether the entity has local
    /// operations outstanding.
    pub fn receive(&mut self, change: RemoteChange, pending: bool, now: Timestamp) -> Result<()> {
        let key = change.key()?;
        let received = Received { change, at: now };
        if pending {
            self.held.insert(key, received);
        } else {
            self.burst.insert(key, received);
            self.burst_started.get_or_insert(now);
            self.last_event = Some(now);
        }
        Ok(())
    }

    /// When the current burst will be due, if there is one.
    pub fn next_flush_at(&self) -> Option<Timestamp> {
        let started = self.burst_started?;
        let last = self.last_event.unwrap_or(started);
        Some((last + self.window).min(started + self.window * MAX_WAIT_WINDOWS))
    }

    /// Take the burst if it is due.
    pub fn flush_due(&mut self, now: Timestamp) -> Vec<(RemoteChange, Timestamp)> {
        match self.next_flush_at() {
            Some(due) if now >= due => {
                self.burst_started = None;
                self.last_event = None;
                std::mem::take(&mut self.burst)
                    .into_values()
                    .map(|r| (r.change, r.at))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// The held-back change for an entity.
    pub fn held(&self, key: &EntityKey) -> Option<(&RemoteChange, Timestamp)> {
        self.held.get(key).map(|r| (&r.change, r.at))
    }

    pub fn take_held(&mut self, key: &EntityKey) -> Option<(RemoteChange, Timestamp)> {
        self.held.remove(key).map(|r| (r.change, r.at))
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn burst_len(&self) -> usize {
        self.burst.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(id: &str, stock: i64) -> RemoteChange {
        RemoteChange::new(
            EntityType::Product,
            ChangeEventType::Update,
            json!({"id": id, "name": "Soap", "currentStock": stock})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    #[test]
    fn burst_is_flushed_after_quiet_window() {
        let mut listener = ChangeListener::new(500);
        listener.receive(change("p-1", 1), false, 1000).unwrap();
        listener.receive(change("p-1", 2), false, 1200).unwrap();
        listener.receive(change("p-2", 5), false, 1300).unwrap();
        assert_eq!(listener.burst_len(), 2);

        assert!(listener.flush_due(1700).is_empty());
        let flushed = listener.flush_due(1800);
        assert_eq!(flushed.len(), 2);
        let p1 = flushed.iter().find(|(c, _)| c.row["id"] == "p-1").unwrap();
        assert_eq!(p1.0.row["currentStock"], json!(2));
        assert_eq!(listener.next_flush_at(), None);
    }

    #[test]
    fn continuous_burst_is_flushed_after_max_wait() {
        let mut listener = ChangeListener::new(500);
        for t in (0..2000).step_by(100) {
            listener.receive(change("p-1", t as i64), false, t).unwrap();
        }
        assert_eq!(listener.next_flush_at(), Some(2000));
        assert_eq!(listener.flush_due(2000).len(), 1);
    }

    #[test]
    fn pending_entities_are_held() {
        let mut listener = ChangeListener::new(500);
        listener.receive(change("p-1", 7), true, 1000).unwrap();

        assert!(listener.flush_due(10_000).is_empty());
        let key = EntityKey::new(EntityType::Product, "p-1");
        assert!(listener.held(&key).is_some());
        let (held, at) = listener.take_held(&key).unwrap();
        assert_eq!(held.row["currentStock"], json!(7));
        assert_eq!(at, 1000);
        assert_eq!(listener.held_count(), 0);
    }

    #[test]
    fn change_without_id_is_rejected() {
        let mut listener = ChangeListener::default();
        let bad = RemoteChange::new(EntityType::Product, ChangeEventType::Insert, Fields::new());
        assert!(listener.receive(bad, false, 1).is_err());
    }

    #[test]
    fn stale_changes_are_ignored() {
        let row = json!({"id": "p-1", "name": "Soap", "updatedAt": 5000});
        let entity =
            Entity::from_remote(EntityType::Product, row.as_object().cloned().unwrap(), 1).unwrap();

        let mut older = change("p-1", 1);
        older.row.insert("updatedAt".into(), json!(4000));
        assert_eq!(merge_remote(Some(&entity), &older, 6000).unwrap(), Merge::Stale);

        let mut newer = change("p-1", 1);
        newer.row.insert("updatedAt".into(), json!(6000));
        assert!(matches!(
            merge_remote(Some(&entity), &newer, 6000).unwrap(),
            Merge::Upsert(e) if e.confirmed_at() == Some(6000)
        ));

        let delete = RemoteChange::new(EntityType::Product, ChangeEventType::Delete, older.row.clone());
        assert_eq!(merge_remote(Some(&entity), &delete, 1).unwrap(), Merge::Remove);
        assert_eq!(merge_remote(None, &delete, 1).unwrap(), Merge::Stale);
    }

    #[test]
    fn event_type_accepts_uppercase() {
        let parsed: ChangeEventType = serde_json::from_str("\"UPDATE\"").unwrap();
        assert_eq!(parsed, ChangeEventType::Update);
    }
}
