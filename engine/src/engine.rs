//! Engine - the facade that wires the components together.
//!
//! The Engine owns the local cache, the pending queue, the idempotency log,
//! the network monitor and the realtime listener. Every public method runs
//! to completion synchronously; the host drives it with mutation intents,
//! connectivity observations, remote outcomes and remote changes.

use crate::{
    cache::{CacheChange, LocalCacheStore, SubscriptionId},
    entity::{Entity, EntityKey, EntityType, Fields, SyncState},
    error::Result,
    events::EngineEvent,
    monitor::{NetworkMonitor, Transition, DEFAULT_ONLINE_DEBOUNCE_MS},
    operation::{Mutation, PendingOperation},
    optimistic::{self, AppliedLog},
    queue::{EnqueueOutcome, PendingQueue, DEFAULT_MAX_ATTEMPTS},
    realtime::{merge_remote, ChangeEventType, ChangeListener, Merge, RemoteChange, DEFAULT_DEBOUNCE_MS},
    reconcile::{Reconciler, RemoteOutcome, StepResult, SyncStep},
    schema::Schema,
    sequence::OpSequence,
    snapshot::{AppliedSnapshot, QueueSnapshot},
    storage::{Storage, APPLIED_KEY, QUEUE_KEY},
    NodeId, OperationId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique identifier of this installation, used in operation ids
    pub node_id: NodeId,
    /// Attempts before an operation is dead-lettered
    pub max_attempts: u32,
    /// How long reachability must hold before going online
    pub online_debounce_ms: u64,
    /// Quiet window before a burst of remote changes is applied
    pub realtime_debounce_ms: u64,
    pub schema: Schema,
}

impl EngineConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            online_debounce_ms: DEFAULT_ONLINE_DEBOUNCE_MS,
            realtime_debounce_ms: DEFAULT_DEBOUNCE_MS,
            schema: Schema::shop(),
        }
    }
}

/// Sync indicator for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    /// `None` when the entity is not in the cache
    pub sync_state: Option<SyncState>,
    /// Live operations touching the entity
    pub pending_ops: usize,
    pub dead_lettered: usize,
    pub last_error: Option<String>,
}

/// The offline-first sync engine.
#[derive(Debug)]
pub struct Engine {
    cache: LocalCacheStore,
    queue: PendingQueue,
    log: AppliedLog,
    sequence: OpSequence,
    monitor: NetworkMonitor,
    listener: ChangeListener,
    /// Outbox drained by the host
    events: Vec<EngineEvent>,
    schema: Schema,
    persist_failures: u64,
}

impl Engine {
    /// Open an engine on durable storage, restoring the cache, the queue
    /// and the idempotency log.
    ///
    /// A corrupt cached collection starts empty, but a corrupt queue is an
    /// error: dropping it would silently lose mutations.
    pub fn open(config: EngineConfig, storage: Box<dyn Storage>) -> Result<Self> {
        let cache = LocalCacheStore::open(storage);

        let (sequence, operations) = match cache.storage().get_item(QUEUE_KEY)? {
            Some(json) => {
                let snapshot = QueueSnapshot::from_json(&json)?;
                (
                    OpSequence::with_counter(config.node_id.clone(), snapshot.sequence.counter),
                    snapshot.operations,
                )
            }
            None => (OpSequence::new(config.node_id.clone()), Vec::new()),
        };

        let mut log = match cache.storage().get_item(APPLIED_KEY) {
            Ok(Some(json)) => match AppliedSnapshot::from_json(&json) {
                Ok(snapshot) => snapshot.log,
                Err(e) => {
                    tracing::warn!(error = %e, "applied log unreadable, rebuilding from queue");
                    AppliedLog::default()
                }
            },
            Ok(None) => AppliedLog::default(),
            Err(e) => {
                tracing::warn!(error = %e, "applied log unavailable, rebuilding from queue");
                AppliedLog::default()
            }
        };
        // Queued operations were applied before they were persisted
        for op in &operations {
            log.record(op.id.clone());
        }

        let queue = PendingQueue::from_ops(operations, config.max_attempts);
        tracing::info!(
            node_id = %config.node_id,
            pending = queue.pending_count(),
            dead_lettered = queue.len() - queue.pending_count(),
            "engine opened"
        );

        Ok(Self {
            cache,
            queue,
            log,
            sequence,
            monitor: NetworkMonitor::new(config.online_debounce_ms),
            listener: ChangeListener::new(config.realtime_debounce_ms),
            events: Vec::new(),
            schema: config.schema,
            persist_failures: 0,
        })
    }

    /// Give the durable storage back, e.g. to simulate a restart.
    pub fn into_storage(self) -> Box<dyn Storage> {
        self.cache.into_storage()
    }

    // ========== Reads ==========

    /// Active entities of a type, in cache order.
    pub fn entities(&self, entity_type: EntityType) -> Vec<Entity> {
        self.cache.get(entity_type).into_iter().cloned().collect()
    }

    /// An active entity by id.
    pub fn entity(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.cache.get_entity(entity_type, id).cloned()
    }

    pub fn cache(&self) -> &LocalCacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Register a cache observer.
    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: Fn(&CacheChange) + Send + Sync + 'static,
    {
        self.cache.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    /// Pending and dead-letter indicators for one entity.
    pub fn status(&self, entity_type: EntityType, id: &str) -> EntityStatus {
        let key = EntityKey::new(entity_type, id);
        let ops: Vec<&PendingOperation> = self.queue.ops_for(&key).collect();

        EntityStatus {
            sync_state: self
                .cache
                .get_including_deleted(entity_type, id)
                .map(|e| e.sync_state),
            pending_ops: ops.iter().filter(|op| op.is_live()).count(),
            dead_lettered: ops.iter().filter(|op| !op.is_live()).count(),
            last_error: ops.iter().rev().find_map(|op| op.last_error.clone()),
        }
    }

    /// Writes to durable storage that failed, cache and queue together.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures + self.cache.persist_failures()
    }

    /// Take the accumulated events.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    // ========== Mutations ==========

    /// Apply a mutation intent optimistically and queue it for sync.
    ///
    /// Returns the resulting primary entity for immediate display. Invalid
    /// intents are rejected here and never reach the queue.
    pub fn mutate(&mut self, mutation: Mutation, now: Timestamp) -> Result<Entity> {
        let mutation = self.schema.prepare(mutation)?;
        let (id, seq) = self.sequence.next();
        let op = mutation.into_operation(id, seq, now)?;
        let entity = optimistic::apply(&mut self.cache, &mut self.log, &op, now)?;

        let keys = op.keys();
        let op_id = op.id.clone();
        match self.queue.enqueue(op) {
            EnqueueOutcome::Appended(_) => {
                tracing::debug!(%op_id, entity_type = %entity.entity_type, entity_id = %entity.id, "operation queued");
            }
            EnqueueOutcome::Coalesced { into } => {
                self.log.complete(&op_id);
                tracing::debug!(%op_id, %into, "operation coalesced");
            }
            EnqueueOutcome::Cancelled { create_op } => {
                self.log.complete(&op_id);
                self.log.complete(&create_op);
                for key in &keys {
                    optimistic::rebase(&mut self.cache, key, &self.queue);
                }
                tracing::debug!(%op_id, %create_op, "delete cancelled an unsent create");
            }
        }

        for key in keys {
            self.events.push(EngineEvent::EntityUpdated {
                entity_type: key.entity_type,
                id: key.id,
            });
        }
        self.persist();
        Ok(entity)
    }

    /// Apply an already built operation to the cache without queueing it.
    /// Re-applying an operation id changes nothing.
    pub fn apply(&mut self, op: &PendingOperation, now: Timestamp) -> Result<Entity> {
        let entity = optimistic::apply(&mut self.cache, &mut self.log, op, now)?;
        self.persist();
        Ok(entity)
    }

    /// Put a dead-lettered operation back in the queue and re-apply its
    /// effects.
    pub fn retry_dead_lettered(&mut self, op_id: &str) -> Result<()> {
        self.queue.retry_dead_lettered(op_id)?;
        if let Some(op) = self.queue.get(op_id) {
            for key in op.keys() {
                optimistic::rebase(&mut self.cache, &key, &self.queue);
                self.events.push(EngineEvent::EntityUpdated {
                    entity_type: key.entity_type,
                    id: key.id,
                });
            }
        }
        tracing::info!(op_id, "dead-lettered operation retried");
        self.persist();
        Ok(())
    }

    /// Drop a dead-lettered operation for good.
    pub fn discard_dead_lettered(&mut self, op_id: &str) -> Result<PendingOperation> {
        let op = self.queue.discard(op_id)?;
        self.log.complete(op_id);
        for key in op.keys() {
            optimistic::rebase(&mut self.cache, &key, &self.queue);
        }
        tracing::info!(op_id, "dead-lettered operation discarded");
        self.persist();
        Ok(op)
    }

    // ========== Connectivity ==========

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Feed a reachability observation to the network monitor.
    pub fn observe_connectivity(&mut self, reachable: bool, now: Timestamp) -> Option<Transition> {
        let transition = self.monitor.observe(reachable, now);
        self.on_transition(transition)
    }

    /// Report a pending online transition once its debounce elapsed.
    pub fn poll_connectivity(&mut self, now: Timestamp) -> Option<Transition> {
        let transition = self.monitor.poll(now);
        self.on_transition(transition)
    }

    pub fn online_due_at(&self) -> Option<Timestamp> {
        self.monitor.online_due_at()
    }

    fn on_transition(&mut self, transition: Option<Transition>) -> Option<Transition> {
        let online = match transition? {
            Transition::WentOnline => true,
            Transition::WentOffline => false,
        };
        tracing::info!(online, pending = self.queue.pending_count(), "connectivity changed");
        self.events.push(EngineEvent::ConnectivityChanged { online });
        transition
    }

    // ========== Sync ==========

    /// Operations that may be sent now, at most `limit`. Empty while offline.
    pub fn ready_operations(&self, limit: usize) -> Vec<OperationId> {
        if !self.monitor.is_online() {
            return Vec::new();
        }
        self.queue.ready(limit)
    }

    /// Start the next ready operation, if any.
    pub fn dequeue_next(&mut self, now: Timestamp) -> Result<Option<SyncStep>> {
        match self.ready_operations(1).into_iter().next() {
            Some(op_id) => self.start(&op_id, now).map(Some),
            None => Ok(None),
        }
    }

    /// Mark an operation in flight and return its first remote step.
    pub fn start(&mut self, op_id: &str, now: Timestamp) -> Result<SyncStep> {
        let result = self.reconciler(now).start(op_id);
        self.persist();
        result
    }

    /// Report the outcome of a remote step.
    pub fn record(&mut self, step: &SyncStep, outcome: RemoteOutcome, now: Timestamp) -> Result<StepResult> {
        let result = self.reconciler(now).record(step, outcome);
        self.persist();
        result
    }

    /// Return an in-flight operation to the queue without counting an
    /// attempt, e.g. when the drain stops because connectivity was lost.
    pub fn release(&mut self, op_id: &str) -> Result<()> {
        self.queue.release(op_id)?;
        self.persist();
        Ok(())
    }

    /// Close a drain pass.
    pub fn finish_drain(&mut self, completed: usize) -> usize {
        let remaining = self.queue.pending_count();
        tracing::info!(completed, remaining, "drain pass finished");
        self.events.push(EngineEvent::SyncCompleted { completed, remaining });
        remaining
    }

    fn reconciler(&mut self, now: Timestamp) -> Reconciler<'_> {
        Reconciler {
            cache: &mut self.cache,
            queue: &mut self.queue,
            log: &mut self.log,
            listener: &mut self.listener,
            events: &mut self.events,
            schema: &self.schema,
            now,
        }
    }

    // ========== Remote changes ==========

    /// Accept a pushed remote change. It is buffered; see
    /// [`Engine::flush_remote`].
    pub fn receive_remote(&mut self, mut change: RemoteChange, now: Timestamp) -> Result<()> {
        change.row = match change.event_type {
            ChangeEventType::Delete => self.schema.normalize(change.entity_type, change.row),
            _ => self.schema.normalize_row(change.entity_type, change.row)?,
        };
        let key = change.key()?;
        let pending = self.queue.has_pending_for(&key);
        if pending {
            tracing::debug!(entity = %key, "holding remote change behind local operations");
        }
        self.listener.receive(change, pending, now)
    }

    /// When [`Engine::flush_remote`] next has work.
    pub fn next_flush_at(&self) -> Option<Timestamp> {
        self.listener.next_flush_at()
    }

    /// Merge the debounced burst of remote changes into the cache, one
    /// notification per entity type. Returns the number of entities changed.
    pub fn flush_remote(&mut self, now: Timestamp) -> usize {
        let mut upserts: BTreeMap<EntityType, Vec<Entity>> = BTreeMap::new();
        let mut changed = 0;

        for (change, at) in self.listener.flush_due(now) {
            let Ok(key) = change.key() else { continue };
            // A local write may have started during the debounce window
            if self.queue.has_pending_for(&key) {
                if let Err(e) = self.listener.receive(change, true, at) {
                    tracing::warn!(entity = %key, error = %e, "dropping remote change");
                }
                continue;
            }

            let current = self.cache.get_including_deleted(key.entity_type, &key.id);
            match merge_remote(current, &change, at) {
                Ok(Merge::Upsert(entity)) => {
                    upserts.entry(key.entity_type).or_default().push(entity);
                }
                Ok(Merge::Remove) => {
                    self.cache.remove(key.entity_type, &key.id);
                }
                Ok(Merge::Stale) => {
                    tracing::debug!(entity = %key, "ignoring stale remote change");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(entity = %key, error = %e, "dropping remote change");
                    continue;
                }
            }
            changed += 1;
            self.events.push(EngineEvent::EntityUpdated {
                entity_type: key.entity_type,
                id: key.id,
            });
        }

        for (entity_type, entities) in upserts {
            self.cache.merge_batch(entity_type, entities);
        }
        changed
    }

    /// Replace a collection with a full remote fetch.
    ///
    /// Entities with unsynced local operations keep their local version;
    /// the fetched row becomes their confirmed base and outstanding
    /// operations are replayed on top of it.
    pub fn refresh(&mut self, entity_type: EntityType, rows: Vec<Fields>, now: Timestamp) -> Result<usize> {
        let mut entities = Vec::with_capacity(rows.len());
        let mut seen = BTreeSet::new();
        let mut rebase = Vec::new();

        for row in rows {
            let row = self.schema.normalize_row(entity_type, row)?;
            let remote = Entity::from_remote(entity_type, row, now)?;
            let key = remote.key();
            seen.insert(remote.id.clone());

            if self.queue.ops_for(&key).next().is_some() {
                let mut local = self
                    .cache
                    .get_including_deleted(entity_type, &remote.id)
                    .cloned()
                    .unwrap_or_else(|| remote.clone());
                local.confirmed = remote.confirmed;
                entities.push(local);
                rebase.push(key);
            } else {
                entities.push(remote);
            }
        }

        // Unsynced local creates are not in the remote result yet
        for local in self.cache.all(entity_type) {
            if !seen.contains(&local.id) && self.queue.ops_for(&local.key()).next().is_some() {
                entities.push(local.clone());
            }
        }

        let count = entities.len();
        self.cache.replace_all(entity_type, entities);
        for key in &rebase {
            optimistic::rebase(&mut self.cache, key, &self.queue);
        }
        tracing::debug!(%entity_type, count, preserved = rebase.len(), "collection refreshed");
        Ok(count)
    }

    // ========== Persistence ==========

    fn persist(&mut self) {
        let storage = self.cache.storage_mut();
        let queue = QueueSnapshot::new(self.sequence.clone(), self.queue.to_vec())
            .to_json()
            .and_then(|json| storage.set_item(QUEUE_KEY, &json));
        let applied = AppliedSnapshot::new(self.log.clone())
            .to_json()
            .and_then(|json| storage.set_item(APPLIED_KEY, &json));

        for (key, result) in [(QUEUE_KEY, queue), (APPLIED_KEY, applied)] {
            if let Err(e) = result {
                self.persist_failures += 1;
                tracing::warn!(key, error = %e, "failed to persist sync state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Change, LinkedUpdate};
    use crate::storage::MemoryStorage;
    use crate::RemoteRequest;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> Engine {
        let mut config = EngineConfig::new("till-1");
        config.online_debounce_ms = 0;
        config.realtime_debounce_ms = 100;
        Engine::open(config, Box::new(MemoryStorage::new())).unwrap()
    }

    fn seed_customer(engine: &mut Engine, debt: i64) {
        engine
            .refresh(
                EntityType::Customer,
                vec![fields(json!({"id": "c-1", "name": "Amina", "outstanding_debt": debt, "updated_at": 100}))],
                100,
            )
            .unwrap();
    }

    #[test]
    fn mutate_rejects_invalid_intent() {
        let mut engine = engine();
        let missing_name = Mutation::create(EntityType::Product, fields(json!({"currentStock": 3})));

        assert!(engine.mutate(missing_name, 1).is_err());
        assert!(engine.queue().is_empty());
        assert!(engine.entities(EntityType::Product).is_empty());
    }

    #[test]
    fn offline_engine_has_nothing_ready() {
        let mut engine = engine();
        engine
            .mutate(Mutation::create(EntityType::Product, fields(json!({"name": "Soap"}))), 1)
            .unwrap();

        assert!(engine.ready_operations(10).is_empty());
        assert_eq!(engine.dequeue_next(2).unwrap(), None);

        assert_eq!(engine.observe_connectivity(true, 3), Some(Transition::WentOnline));
        assert_eq!(engine.ready_operations(10), vec!["till-1-1".to_string()]);
    }

    #[test]
    fn status_reports_pending_and_dead_letters() {
        let mut engine = engine();
        seed_customer(&mut engine, 500);
        engine.observe_connectivity(true, 1);
        engine
            .mutate(
                Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -100.0)),
                2,
            )
            .unwrap();

        let status = engine.status(EntityType::Customer, "c-1");
        assert_eq!(status.sync_state, Some(SyncState::PendingUpdate));
        assert_eq!(status.pending_ops, 1);

        let step = engine.dequeue_next(3).unwrap().unwrap();
        engine
            .record(&step, RemoteOutcome::Rejected("negative balance".into()), 4)
            .unwrap();

        let status = engine.status(EntityType::Customer, "c-1");
        assert_eq!(status.sync_state, Some(SyncState::Synced));
        assert_eq!(status.pending_ops, 0);
        assert_eq!(status.dead_lettered, 1);
        assert_eq!(status.last_error.as_deref(), Some("negative balance"));
        assert_eq!(engine.entity(EntityType::Customer, "c-1").unwrap().fields["outstandingDebt"], json!(500));
    }

    #[test]
    fn retry_and_discard_dead_letter() {
        let mut engine = engine();
        engine.observe_connectivity(true, 1);
        engine
            .mutate(Mutation::create(EntityType::Product, fields(json!({"name": "Soap"}))), 2)
            .unwrap();
        let step = engine.dequeue_next(3).unwrap().unwrap();
        engine.record(&step, RemoteOutcome::Rejected("duplicate".into()), 4).unwrap();
        assert!(engine.entities(EntityType::Product).is_empty());

        engine.retry_dead_lettered(&step.op_id).unwrap();
        assert_eq!(engine.entities(EntityType::Product).len(), 1);
        assert_eq!(engine.ready_operations(5), vec![step.op_id.clone()]);

        let step = engine.dequeue_next(5).unwrap().unwrap();
        engine.record(&step, RemoteOutcome::Rejected("duplicate".into()), 6).unwrap();
        engine.discard_dead_lettered(&step.op_id).unwrap();
        assert!(engine.queue().is_empty());
        assert!(engine.entities(EntityType::Product).is_empty());
    }

    #[test]
    fn delete_of_unsent_create_sends_nothing() {
        let mut engine = engine();
        let product = engine
            .mutate(Mutation::create(EntityType::Product, fields(json!({"name": "Soap"}))), 1)
            .unwrap();
        engine
            .mutate(Mutation::delete(EntityType::Product, product.id.clone()), 2)
            .unwrap();

        assert!(engine.queue().is_empty());
        assert!(engine.cache().get_including_deleted(EntityType::Product, &product.id).is_none());
    }

    #[test]
    fn remote_changes_are_debounced_and_held() {
        let mut engine = engine();
        seed_customer(&mut engine, 500);
        engine
            .mutate(
                Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -100.0)),
                200,
            )
            .unwrap();

        let change = |id: &str, debt: i64, at: u64| {
            RemoteChange::new(
                EntityType::Customer,
                ChangeEventType::Update,
                fields(json!({"id": id, "name": "Remote", "outstandingDebt": debt, "updatedAt": at})),
            )
        };
        engine.receive_remote(change("c-1", 900, 300), 300).unwrap();
        engine.receive_remote(change("c-2", 50, 300), 300).unwrap();
        engine.receive_remote(change("c-2", 60, 350), 350).unwrap();

        assert_eq!(engine.flush_remote(400), 0);
        assert_eq!(engine.next_flush_at(), Some(450));
        assert_eq!(engine.flush_remote(450), 1);

        assert_eq!(engine.entity(EntityType::Customer, "c-2").unwrap().fields["outstandingDebt"], json!(60));
        // c-1 keeps its optimistic value while the local payment is queued
        assert_eq!(engine.entity(EntityType::Customer, "c-1").unwrap().fields["outstandingDebt"], json!(400));
    }

    #[test]
    fn refresh_preserves_unsynced_entities() {
        let mut engine = engine();
        seed_customer(&mut engine, 500);
        engine
            .mutate(
                Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -100.0)),
                200,
            )
            .unwrap();
        let local = engine
            .mutate(Mutation::create(EntityType::Customer, fields(json!({"name": "New"}))), 201)
            .unwrap();

        let rows = vec![
            fields(json!({"id": "c-1", "name": "Amina", "outstandingDebt": 700, "updatedAt": 300})),
            fields(json!({"id": "c-3", "name": "Other", "updatedAt": 300})),
        ];
        assert_eq!(engine.refresh(EntityType::Customer, rows, 400).unwrap(), 3);

        assert_eq!(engine.entity(EntityType::Customer, "c-1").unwrap().fields["outstandingDebt"], json!(600));
        assert!(engine.entity(EntityType::Customer, &local.id).is_some());
        assert!(engine.entity(EntityType::Customer, "c-3").unwrap().is_synced());
    }

    #[test]
    fn linked_update_sends_both_writes() {
        let mut engine = engine();
        seed_customer(&mut engine, 0);
        engine.observe_connectivity(true, 1);
        engine
            .mutate(
                Mutation::create(EntityType::DebtPayment, fields(json!({"customerId": "c-1", "amount": 200})))
                    .with_linked(LinkedUpdate::new(
                        EntityType::Customer,
                        "c-1",
                        Change::adjust("outstandingDebt", -200.0),
                    )),
                2,
            )
            .unwrap();

        let step = engine.dequeue_next(3).unwrap().unwrap();
        assert!(matches!(step.request, RemoteRequest::Insert { .. }));
        let row = fields(json!({"id": "dp-1", "customerId": "c-1", "amount": 200, "updatedAt": 10}));
        let StepResult::Continue(linked) = engine.record(&step, RemoteOutcome::Applied(Some(row)), 4).unwrap() else {
            panic!("expected linked step");
        };
        assert_eq!(linked.table(), "customers");

        let result = engine.record(&linked, RemoteOutcome::Applied(None), 5).unwrap();
        assert_eq!(result, StepResult::Completed);
        assert_eq!(engine.finish_drain(1), 0);
        assert_eq!(engine.entity(EntityType::Customer, "c-1").unwrap().fields["outstandingDebt"], json!(-200));
        assert!(engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::SyncCompleted { completed: 1, remaining: 0 })));
    }

    #[test]
    fn connectivity_events_are_emitted() {
        let mut engine = engine();
        engine.observe_connectivity(true, 1);
        engine.observe_connectivity(false, 2);

        let events = engine.drain_events();
        assert_eq!(
            events,
            vec![
                EngineEvent::ConnectivityChanged { online: true },
                EngineEvent::ConnectivityChanged { online: false },
            ]
        );
        assert!(engine.drain_events().is_empty());
    }
}
