//! Local cache store - the single source of truth for the UI.
//!
//! All writes go through [`LocalCacheStore::put`], [`LocalCacheStore::remove`]
//! and [`LocalCacheStore::replace_all`] (plus the batched
//! [`LocalCacheStore::merge_batch`]). Each write updates the in-memory
//! collection, mirrors it to durable storage and notifies observers.
//!
//! Durability is best-effort: a storage failure is logged and counted but
//! never fails the write, so optimistic updates are never blocked by a full
//! disk or an exceeded quota.

use crate::{
    entity::{Entity, EntityType},
    snapshot::CollectionSnapshot,
    storage::Storage,
    EntityId,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Handle returned by [`LocalCacheStore::subscribe`].
pub type SubscriptionId = u64;

type Observer = Box<dyn Fn(&CacheChange) + Send + Sync>;

/// A change notification delivered to cache observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CacheChange {
    /// One entity was inserted or replaced
    Upserted { entity: Entity },
    /// One entity was purged
    #[serde(rename_all = "camelCase")]
    Removed {
        entity_type: EntityType,
        id: EntityId,
    },
    /// Several entities changed at once
    #[serde(rename_all = "camelCase")]
    Reloaded {
        entity_type: EntityType,
        ids: Vec<EntityId>,
    },
}

impl CacheChange {
    pub fn entity_type(&self) -> EntityType {
        match self {
            CacheChange::Upserted { entity } => entity.entity_type,
            CacheChange::Removed { entity_type, .. } | CacheChange::Reloaded { entity_type, .. } => {
                *entity_type
            }
        }
    }
}

/// Write-through entity cache keyed by entity type.
pub struct LocalCacheStore {
    /// Entities per type, in insertion order
    collections: BTreeMap<EntityType, Vec<Entity>>,
    storage: Box<dyn Storage>,
    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: SubscriptionId,
    persist_failures: u64,
}

impl fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("collections", &self.collections)
            .field("observers", &self.observers.len())
            .field("persist_failures", &self.persist_failures)
            .finish()
    }
}

impl LocalCacheStore {
    /// Load every cached collection from storage.
    ///
    /// Unreadable or corrupt collections start empty; the next refresh from
    /// the backend repopulates them.
    pub fn open(storage: Box<dyn Storage>) -> Self {
        let mut collections = BTreeMap::new();
        for entity_type in EntityType::ALL {
            let key = entity_type.cache_key();
            let loaded = storage
                .get_item(&key)
                .and_then(|raw| raw.map(|json| CollectionSnapshot::from_json(&json)).transpose());

            match loaded {
                Ok(Some(snapshot)) if snapshot.entity_type == entity_type => {
                    collections.insert(entity_type, snapshot.entities);
                }
                Ok(Some(_)) => {
                    tracing::warn!(%key, "cached collection has a mismatched entity type, ignoring");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%key, error = %e, "failed to load cached collection");
                }
            }
        }

        Self {
            collections,
            storage,
            observers: Vec::new(),
            next_subscription: 1,
            persist_failures: 0,
        }
    }

    /// Active (non-tombstoned) entities of a type, in insertion order.
    pub fn get(&self, entity_type: EntityType) -> Vec<&Entity> {
        self.all(entity_type).filter(|e| e.is_active()).collect()
    }

    /// Every entity of a type, tombstones included.
    pub fn all(&self, entity_type: EntityType) -> impl Iterator<Item = &Entity> {
        self.collections
            .get(&entity_type)
            .into_iter()
            .flat_map(|entities| entities.iter())
    }

    /// An active entity by id.
    pub fn get_entity(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.get_including_deleted(entity_type, id)
            .filter(|e| e.is_active())
    }

    /// An entity by id, even if tombstoned.
    pub fn get_including_deleted(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.all(entity_type).find(|e| e.id == id)
    }

    pub fn len(&self, entity_type: EntityType) -> usize {
        self.all(entity_type).filter(|e| e.is_active()).count()
    }

    pub fn is_empty(&self, entity_type: EntityType) -> bool {
        self.len(entity_type) == 0
    }

    /// Upsert an entity by id.
    pub fn put(&mut self, entity: Entity) {
        let entity_type = entity.entity_type;
        self.upsert(entity.clone());
        self.persist(entity_type);
        self.notify(&CacheChange::Upserted { entity });
    }

    /// Purge an entity.
    pub fn remove(&mut self, entity_type: EntityType, id: &str) -> Option<Entity> {
        let entities = self.collections.get_mut(&entity_type)?;
        let index = entities.iter().position(|e| e.id == id)?;
        let removed = entities.remove(index);

        self.persist(entity_type);
        self.notify(&CacheChange::Removed {
            entity_type,
            id: id.to_string(),
        });
        Some(removed)
    }

    /// Replace a whole collection, e.g. after a full remote refresh.
    pub fn replace_all(&mut self, entity_type: EntityType, entities: Vec<Entity>) {
        let ids = entities.iter().map(|e| e.id.clone()).collect();
        self.collections.insert(entity_type, entities);
        self.persist(entity_type);
        self.notify(&CacheChange::Reloaded { entity_type, ids });
    }

    /// Upsert several entities of one type with a single notification.
    pub fn merge_batch(&mut self, entity_type: EntityType, entities: Vec<Entity>) {
        if entities.is_empty() {
            return;
        }
        let ids = entities.iter().map(|e| e.id.clone()).collect();
        for entity in entities {
            self.upsert(entity);
        }
        self.persist(entity_type);
        self.notify(&CacheChange::Reloaded { entity_type, ids });
    }

    /// Change an entity's id in place, keeping its position.
    pub fn replace_id(&mut self, entity_type: EntityType, old: &str, new: &str) -> bool {
        let Some(entities) = self.collections.get_mut(&entity_type) else {
            return false;
        };
        // A row with the new id may already have arrived through realtime
        entities.retain(|e| e.id != new);
        let Some(entity) = entities.iter_mut().find(|e| e.id == old) else {
            return false;
        };
        entity.id = new.to_string();
        let entity = entity.clone();

        self.persist(entity_type);
        self.notify(&CacheChange::Removed {
            entity_type,
            id: old.to_string(),
        });
        self.notify(&CacheChange::Upserted { entity });
        true
    }

    /// Replace every string field equal to `old` with `new` across all
    /// collections, e.g. a sale's `customerId` after the customer got its
    /// server id. Returns the number of entities changed.
    pub fn rewrite_references(&mut self, old: &str, new: &str) -> usize {
        let mut changed = BTreeMap::<EntityType, Vec<EntityId>>::new();
        for (entity_type, entities) in &mut self.collections {
            for entity in entities.iter_mut() {
                let mut touched = replace_string_values(&mut entity.fields, old, new);
                if let Some(confirmed) = &mut entity.confirmed {
                    touched |= replace_string_values(&mut confirmed.fields, old, new);
                }
                if touched {
                    changed.entry(*entity_type).or_default().push(entity.id.clone());
                }
            }
        }

        let count = changed.values().map(Vec::len).sum();
        for (entity_type, ids) in changed {
            self.persist(entity_type);
            self.notify(&CacheChange::Reloaded { entity_type, ids });
        }
        count
    }

    /// Register an observer called after every write.
    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: Fn(&CacheChange) + Send + Sync + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _)| *sub != id);
        self.observers.len() != before
    }

    /// Number of writes that could not be mirrored to storage.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        self.storage.as_mut()
    }

    pub fn into_storage(self) -> Box<dyn Storage> {
        self.storage
    }

    fn upsert(&mut self, entity: Entity) {
        let entities = self.collections.entry(entity.entity_type).or_default();
        match entities.iter_mut().find(|e| e.id == entity.id) {
            Some(existing) => *existing = entity,
            None => entities.push(entity),
        }
    }

    fn persist(&mut self, entity_type: EntityType) {
        let key = entity_type.cache_key();
        let entities = self
            .collections
            .get(&entity_type)
            .cloned()
            .unwrap_or_default();
        let result = CollectionSnapshot::new(entity_type, entities)
            .to_json()
            .and_then(|json| self.storage.set_item(&key, &json));

        if let Err(e) = result {
            self.persist_failures += 1;
            tracing::warn!(%key, error = %e, "cache write-through failed, keeping in-memory state");
        }
    }

    fn notify(&self, change: &CacheChange) {
        for (_, observer) in &self.observers {
            observer(change);
        }
    }
}

fn replace_string_values(fields: &mut crate::entity::Fields, old: &str, new: &str) -> bool {
    let mut touched = false;
    for (name, value) in fields.iter_mut() {
        if name != "id" && value.as_str() == Some(old) {
            *value = serde_json::Value::String(new.to_string());
            touched = true;
        }
    }
    touched
}
