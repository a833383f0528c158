//! Optimistic application of operations to the local cache.
//!
//! [`apply`] writes the effect of an operation before any network call is
//! made. [`rebase`] recomputes an entity from its last confirmed remote
//! state plus the operations still outstanding against it; it is how the
//! engine absorbs authoritative results, remote changes and reverts
//! without double-counting relative adjustments.

use crate::{
    cache::LocalCacheStore,
    entity::{Entity, EntityKey, SyncState},
    error::Result,
    operation::{OperationKind, PendingOperation, Phase},
    queue::PendingQueue,
    Error, OperationId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Completed operation ids kept for duplicate detection.
pub const APPLIED_LOG_RETENTION: usize = 1024;

/// Ids of operations whose effect is already in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedLog {
    live: BTreeSet<OperationId>,
    completed: VecDeque<OperationId>,
}

impl AppliedLog {
    /// Record an applied operation. Returns false if it was already known.
    pub fn record(&mut self, id: impl Into<OperationId>) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.live.insert(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.live.contains(id) || self.completed.iter().any(|c| c == id)
    }

    /// Move an operation out of the live set once it left the queue.
    pub fn complete(&mut self, id: &str) {
        if !self.live.remove(id) && self.completed.iter().any(|c| c == id) {
            return;
        }
        self.completed.push_back(id.to_string());
        while self.completed.len() > APPLIED_LOG_RETENTION {
            self.completed.pop_front();
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Apply an operation to the cache and return the resulting primary entity.
///
/// Applying an operation id that is already in the log changes nothing and
/// returns the current entity. The primary and linked entities are both
/// computed before either is written, so a failure leaves the cache as it
/// was.
pub fn apply(
    cache: &mut LocalCacheStore,
    log: &mut AppliedLog,
    op: &PendingOperation,
    now: Timestamp,
) -> Result<Entity> {
    if log.contains(&op.id) {
        return cache
            .get_including_deleted(op.entity_type, &op.entity_id)
            .cloned()
            .ok_or_else(|| not_found(&op.key()));
    }

    let primary = next_primary(cache, op, now)?;
    let linked = match &op.linked_update {
        Some(linked) => {
            let key = linked.key();
            let mut entity = cache
                .get_entity(key.entity_type, &key.id)
                .cloned()
                .ok_or_else(|| not_found(&key))?;
            linked.change.apply_to(&mut entity.fields)?;
            entity.updated_at = now;
            if entity.sync_state == SyncState::Synced {
                entity.sync_state = SyncState::PendingUpdate;
            }
            Some(entity)
        }
        None => None,
    };

    cache.put(primary.clone());
    if let Some(linked) = linked {
        cache.put(linked);
    }
    log.record(op.id.clone());
    Ok(primary)
}

fn next_primary(cache: &LocalCacheStore, op: &PendingOperation, now: Timestamp) -> Result<Entity> {
    let key = op.key();
    match op.kind {
        OperationKind::Create => {
            if cache.get_entity(key.entity_type, &key.id).is_some() {
                return Err(Error::EntityAlreadyExists {
                    entity_type: key.entity_type.to_string(),
                    id: key.id,
                });
            }
            Ok(Entity::new_local(
                op.entity_type,
                op.entity_id.clone(),
                op.payload.folded()?,
                now,
            ))
        }
        OperationKind::Update => {
            let mut entity = cache
                .get_entity(key.entity_type, &key.id)
                .cloned()
                .ok_or_else(|| not_found(&key))?;
            op.payload.apply_to(&mut entity.fields)?;
            entity.updated_at = now;
            if entity.sync_state == SyncState::Synced {
                entity.sync_state = SyncState::PendingUpdate;
            }
            Ok(entity)
        }
        OperationKind::Delete => {
            let mut entity = cache
                .get_entity(key.entity_type, &key.id)
                .cloned()
                .ok_or_else(|| not_found(&key))?;
            entity.deleted = true;
            entity.updated_at = now;
            entity.sync_state = SyncState::PendingDelete;
            Ok(entity)
        }
    }
}

fn not_found(key: &EntityKey) -> Error {
    Error::EntityNotFound {
        entity_type: key.entity_type.to_string(),
        id: key.id.clone(),
    }
}

/// Recompute an entity from its confirmed remote state plus every queued
/// operation still touching it, and write the result to the cache.
///
/// Dead-lettered operations contribute nothing. Primary effects of
/// operations whose primary write already committed are part of the
/// confirmed state and are skipped; so are linked effects of operations
/// being compensated. Returns `None` when the entity no longer
/// exists (never confirmed and no create outstanding).
pub fn rebase(cache: &mut LocalCacheStore, key: &EntityKey, queue: &PendingQueue) -> Option<Entity> {
    let current = cache.get_including_deleted(key.entity_type, &key.id).cloned();
    let confirmed = current.as_ref().and_then(|e| e.confirmed.clone());

    let mut entity = confirmed.as_ref().map(|c| Entity {
        id: key.id.clone(),
        entity_type: key.entity_type,
        fields: c.fields.clone(),
        updated_at: c.updated_at,
        sync_state: SyncState::Synced,
        deleted: false,
        confirmed: Some(c.clone()),
    });

    for op in queue.ops_for(key).filter(|op| op.is_live()) {
        let is_primary = op.key() == *key;
        let applies = if is_primary {
            op.phase == Phase::Pending
        } else {
            op.phase != Phase::Compensating
        };
        if !applies {
            continue;
        }

        if is_primary && op.kind == OperationKind::Create {
            if entity.is_none() {
                match op.payload.folded() {
                    Ok(fields) => {
                        entity = Some(Entity::new_local(key.entity_type, key.id.clone(), fields, op.created_at))
                    }
                    Err(e) => tracing::warn!(op_id = %op.id, error = %e, "skipping unreplayable create"),
                }
            }
            continue;
        }

        let Some(target) = entity.as_mut() else {
            continue;
        };
        if is_primary && op.kind == OperationKind::Delete {
            target.deleted = true;
            target.sync_state = SyncState::PendingDelete;
        } else if let Some(change) = op.change_for(key) {
            if let Err(e) = change.apply_to(&mut target.fields) {
                tracing::warn!(op_id = %op.id, error = %e, "skipping unreplayable change");
                continue;
            }
            if target.sync_state == SyncState::Synced {
                target.sync_state = SyncState::PendingUpdate;
            }
        }
        target.updated_at = target.updated_at.max(op.created_at);
    }

    match entity {
        Some(entity) => {
            if current.as_ref() != Some(&entity) {
                cache.put(entity.clone());
            }
            Some(entity)
        }
        None => {
            if current.is_some() {
                cache.remove(key.entity_type, &key.id);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityType, Fields};
    use crate::operation::{Change, LinkedUpdate, Mutation};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn cache_with_customer(debt: i64) -> LocalCacheStore {
        let mut cache = LocalCacheStore::open(Box::new(MemoryStorage::new()));
        cache.put(
            Entity::from_remote(
                EntityType::Customer,
                fields(json!({"id": "c-1", "name": "Amina", "outstandingDebt": debt, "updatedAt": 100})),
                100,
            )
            .unwrap(),
        );
        cache
    }

    fn debt(cache: &LocalCacheStore) -> serde_json::Value {
        cache.get_entity(EntityType::Customer, "c-1").unwrap().fields["outstandingDebt"].clone()
    }

    #[test]
    fn applied_log_is_bounded() {
        let mut log = AppliedLog::default();
        for i in 0..(APPLIED_LOG_RETENTION + 10) {
            let id = format!("op-{i}");
            assert!(log.record(id.clone()));
            log.complete(&id);
        }
        assert!(!log.contains("op-0"));
        assert!(log.contains(&format!("op-{}", APPLIED_LOG_RETENTION + 9)));
        assert_eq!(log.live_count(), 0);
        assert!(!log.record(format!("op-{}", APPLIED_LOG_RETENTION + 9)));
    }

    #[test]
    fn apply_twice_does_not_double_count() {
        let mut cache = cache_with_customer(500);
        let mut log = AppliedLog::default();
        let op = Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -200.0))
            .into_operation("op-1", 1, 1000)
            .unwrap();

        let first = apply(&mut cache, &mut log, &op, 1000).unwrap();
        let second = apply(&mut cache, &mut log, &op, 2000).unwrap();

        assert_eq!(first, second);
        assert_eq!(debt(&cache), json!(300));
        assert_eq!(first.sync_state, SyncState::PendingUpdate);
    }

    #[test]
    fn create_inserts_pending_entity() {
        let mut cache = LocalCacheStore::open(Box::new(MemoryStorage::new()));
        let mut log = AppliedLog::default();
        let op = Mutation::create(EntityType::Product, fields(json!({"name": "Soap"})))
            .into_operation("op-1", 1, 1000)
            .unwrap();

        let entity = apply(&mut cache, &mut log, &op, 1000).unwrap();
        assert_eq!(entity.id, "temp-op-1");
        assert_eq!(entity.sync_state, SyncState::PendingCreate);
        assert_eq!(cache.len(EntityType::Product), 1);

        let named = Mutation::create(EntityType::Product, fields(json!({"name": "Salt"})))
            .with_id("p-salt")
            .into_operation("op-2", 2, 1000)
            .unwrap();
        assert_eq!(apply(&mut cache, &mut log, &named, 1000).unwrap().id, "p-salt");
    }

    #[test]
    fn delete_tombstones() {
        let mut cache = cache_with_customer(0);
        let mut log = AppliedLog::default();
        let op = Mutation::delete(EntityType::Customer, "c-1")
            .into_operation("op-1", 1, 1000)
            .unwrap();

        apply(&mut cache, &mut log, &op, 1000).unwrap();
        assert!(cache.get_entity(EntityType::Customer, "c-1").is_none());
        let tombstone = cache.get_including_deleted(EntityType::Customer, "c-1").unwrap();
        assert_eq!(tombstone.sync_state, SyncState::PendingDelete);
    }

    #[test]
    fn linked_update_is_all_or_nothing() {
        let mut cache = cache_with_customer(0);
        let mut log = AppliedLog::default();
        let missing_customer = Mutation::create(EntityType::Sale, fields(json!({"total": 500})))
            .with_linked(LinkedUpdate::new(
                EntityType::Customer,
                "c-404",
                Change::adjust("outstandingDebt", 500.0),
            ))
            .into_operation("op-1", 1, 1000)
            .unwrap();

        assert!(apply(&mut cache, &mut log, &missing_customer, 1000).is_err());
        assert!(cache.is_empty(EntityType::Sale));
        assert!(!log.contains("op-1"));

        let sale = Mutation::create(EntityType::Sale, fields(json!({"total": 500})))
            .with_linked(LinkedUpdate::new(
                EntityType::Customer,
                "c-1",
                Change::adjust("outstandingDebt", 500.0),
            ))
            .into_operation("op-2", 2, 1000)
            .unwrap();
        apply(&mut cache, &mut log, &sale, 1000).unwrap();
        assert_eq!(cache.len(EntityType::Sale), 1);
        assert_eq!(debt(&cache), json!(500));
    }

    #[test]
    fn rebase_replays_outstanding_deltas_on_new_base() {
        let mut cache = cache_with_customer(500);
        let mut log = AppliedLog::default();
        let mut queue = PendingQueue::default();
        let op = Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -200.0))
            .into_operation("op-1", 1, 1000)
            .unwrap();
        apply(&mut cache, &mut log, &op, 1000).unwrap();
        queue.enqueue(op);
        assert_eq!(debt(&cache), json!(300));

        // Another session recorded a payment; the confirmed base moves to 350
        let mut entity = cache.get_entity(EntityType::Customer, "c-1").unwrap().clone();
        entity.confirmed.as_mut().unwrap().fields["outstandingDebt"] = json!(350);
        cache.put(entity);

        let key = EntityKey::new(EntityType::Customer, "c-1");
        let rebased = rebase(&mut cache, &key, &queue).unwrap();
        assert_eq!(rebased.fields["outstandingDebt"], json!(150));
        assert_eq!(rebased.sync_state, SyncState::PendingUpdate);
    }

    #[test]
    fn rebase_without_operations_restores_confirmed() {
        let mut cache = cache_with_customer(500);
        let mut log = AppliedLog::default();
        let op = Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -200.0))
            .into_operation("op-1", 1, 1000)
            .unwrap();
        apply(&mut cache, &mut log, &op, 1000).unwrap();

        let key = EntityKey::new(EntityType::Customer, "c-1");
        let rebased = rebase(&mut cache, &key, &PendingQueue::default()).unwrap();
        assert_eq!(rebased.fields["outstandingDebt"], json!(500));
        assert!(rebased.is_synced());
    }

    #[test]
    fn rebase_drops_never_confirmed_entity() {
        let mut cache = LocalCacheStore::open(Box::new(MemoryStorage::new()));
        let mut log = AppliedLog::default();
        let op = Mutation::create(EntityType::Product, fields(json!({"name": "Soap"})))
            .into_operation("op-1", 1, 1000)
            .unwrap();
        apply(&mut cache, &mut log, &op, 1000).unwrap();

        let key = op.key();
        assert!(rebase(&mut cache, &key, &PendingQueue::default()).is_none());
        assert!(cache.get_including_deleted(EntityType::Product, "temp-op-1").is_none());
    }

    #[test]
    fn rebase_ignores_dead_letters() {
        let mut cache = cache_with_customer(500);
        let mut log = AppliedLog::default();
        let mut queue = PendingQueue::default();
        let op = Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -200.0))
            .into_operation("op-1", 1, 1000)
            .unwrap();
        apply(&mut cache, &mut log, &op, 1000).unwrap();
        queue.enqueue(op);
        queue.dead_letter("op-1", "rejected").unwrap();

        let key = EntityKey::new(EntityType::Customer, "c-1");
        assert_eq!(rebase(&mut cache, &key, &queue).unwrap().fields["outstandingDebt"], json!(500));
    }

    #[test]
    fn rebase_skips_committed_primary() {
        let mut cache = cache_with_customer(0);
        let mut log = AppliedLog::default();
        let mut queue = PendingQueue::default();
        let mut op = Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", 50.0))
            .into_operation("op-1", 1, 1000)
            .unwrap();
        apply(&mut cache, &mut log, &op, 1000).unwrap();

        // Remote confirmed the write and the confirmed base already holds it
        let mut entity = cache.get_entity(EntityType::Customer, "c-1").unwrap().clone();
        entity.confirmed.as_mut().unwrap().fields["outstandingDebt"] = json!(50);
        cache.put(entity);
        op.phase = Phase::PrimaryCommitted;
        queue.enqueue(op);

        let key = EntityKey::new(EntityType::Customer, "c-1");
        assert_eq!(rebase(&mut cache, &key, &queue).unwrap().fields["outstandingDebt"], json!(50));
    }
}
