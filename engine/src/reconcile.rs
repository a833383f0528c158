//! Reconciliation of queued operations against the remote backend.
//!
//! The engine performs no IO, so draining is expressed as a sequence of
//! [`SyncStep`]s. The host sends each step's [`RemoteRequest`], reports the
//! [`RemoteOutcome`] back, and receives a [`StepResult`] telling it whether
//! to send another step for the same operation, or that the operation is
//! done, requeued or dead-lettered.
//!
//! # Stages
//!
//! 1. `Primary` - the operation's own create/update/delete
//! 2. `Linked` - the linked update, once the primary write committed
//! 3. `Compensate` - undoing the primary write after the linked update was
//!    permanently rejected
//!
//! Progress is stored in the operation's [`Phase`], so a retry after a
//! partial commit resumes at the linked update and never resends the
//! primary write.
//!
//! # Conflicts
//!
//! Relative (financial) changes are re-derived from the latest remote state
//! and retried. Anything else resolves last-writer-wins with the remote row
//! as the winner.

use crate::{
    cache::LocalCacheStore,
    entity::{row_id, row_updated_at, Confirmed, Entity, EntityKey, EntityType, Fields, TEMP_ID_PREFIX},
    error::Result,
    events::{ConflictPolicy, EngineEvent},
    operation::{number_value, Change, OperationKind, OperationStatus, PendingOperation, Phase},
    optimistic::{self, AppliedLog},
    queue::{FailureOutcome, PendingQueue},
    realtime::{merge_remote, ChangeEventType, ChangeListener, Merge},
    schema::Schema,
    EntityId, Error, OperationId, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row-level call against the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RemoteRequest {
    /// Insert a row; a row without `id` gets one assigned remotely
    Insert { row: Fields },
    /// Patch a row, conditional on its remote `updatedAt` when known
    #[serde(rename_all = "camelCase")]
    Update {
        id: EntityId,
        patch: Fields,
        expected_updated_at: Option<Timestamp>,
    },
    Delete { id: EntityId },
}

/// Which part of an operation a step carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Primary,
    Linked,
    Compensate,
}

/// One remote call the host must perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStep {
    pub op_id: OperationId,
    pub stage: Stage,
    /// Entity type (and so table) the request targets
    pub entity_type: EntityType,
    pub request: RemoteRequest,
}

impl SyncStep {
    pub fn table(&self) -> &'static str {
        self.entity_type.table()
    }
}

/// What the remote backend said about a step.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// The write landed; carries the authoritative row when the backend returns one
    Applied(Option<Fields>),
    /// Connectivity loss, timeout or server-side failure
    Transient(String),
    /// The payload is invalid and will never be accepted
    Rejected(String),
    /// The record changed remotely; carries the current row when known
    Conflict(Option<Fields>),
    /// The record does not exist remotely
    NotFound,
}

impl RemoteOutcome {
    fn label(&self) -> &'static str {
        match self {
            RemoteOutcome::Applied(_) => "applied",
            RemoteOutcome::Transient(_) => "transient",
            RemoteOutcome::Rejected(_) => "rejected",
            RemoteOutcome::Conflict(_) => "conflict",
            RemoteOutcome::NotFound => "notFound",
        }
    }
}

/// What the host should do next for an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Send this step next
    Continue(SyncStep),
    /// Fully confirmed and removed from the queue
    Completed,
    /// Back in the queue for a later attempt
    Requeued { attempts: u32 },
    /// Abandoned; surfaced to the user
    DeadLettered { reason: String },
}

/// Borrowed view of the engine state the reconciler works on.
pub(crate) struct Reconciler<'a> {
    pub(crate) cache: &'a mut LocalCacheStore,
    pub(crate) queue: &'a mut PendingQueue,
    pub(crate) log: &'a mut AppliedLog,
    pub(crate) listener: &'a mut ChangeListener,
    pub(crate) events: &'a mut Vec<EngineEvent>,
    pub(crate) schema: &'a Schema,
    pub(crate) now: Timestamp,
}

impl Reconciler<'_> {
    /// Mark an operation in flight and plan its next step.
    pub(crate) fn start(&mut self, op_id: &str) -> Result<SyncStep> {
        self.queue.mark_in_flight(op_id)?;
        let op = self.op(op_id)?;
        let stage = match op.phase {
            Phase::Pending => Stage::Primary,
            Phase::PrimaryCommitted => Stage::Linked,
            Phase::Compensating => Stage::Compensate,
        };

        match self.plan(&op, stage) {
            Ok(step) => Ok(step),
            Err(e) => {
                self.dead_letter(op_id, e.to_string())?;
                Err(e)
            }
        }
    }

    /// Resolve the outcome of a step.
    pub(crate) fn record(&mut self, step: &SyncStep, outcome: RemoteOutcome) -> Result<StepResult> {
        let op = self.op(&step.op_id)?;
        if op.status != OperationStatus::InFlight {
            return Err(Error::InvalidOperation(format!(
                "operation {} is not in flight",
                op.id
            )));
        }
        tracing::debug!(
            op_id = %op.id,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            stage = ?step.stage,
            outcome = outcome.label(),
            "remote outcome"
        );

        match step.stage {
            Stage::Primary => self.record_primary(op, step, outcome),
            Stage::Linked => self.record_linked(op, step, outcome),
            Stage::Compensate => self.record_compensation(op, outcome),
        }
    }

    fn record_primary(
        &mut self,
        op: PendingOperation,
        step: &SyncStep,
        outcome: RemoteOutcome,
    ) -> Result<StepResult> {
        match outcome {
            RemoteOutcome::Applied(row) => {
                let compensation = match op.linked_update {
                    Some(_) => self.compensation_for(&op),
                    None => None,
                };
                let key = self.confirm_primary(&op, step, row)?;
                if op.linked_update.is_none() {
                    return self.complete(&op.id);
                }

                let entry = self.queue.get_mut(&op.id)?;
                entry.phase = Phase::PrimaryCommitted;
                entry.compensation = compensation;
                let op = entry.clone();
                optimistic::rebase(self.cache, &key, self.queue);
                Ok(StepResult::Continue(self.plan(&op, Stage::Linked)?))
            }
            RemoteOutcome::Transient(reason) => self.retry_later(&op.id, reason),
            RemoteOutcome::Rejected(reason) => self.reject(&op.id, reason),
            RemoteOutcome::Conflict(current) => match op.kind {
                OperationKind::Create => {
                    self.reject(&op.id, "a conflicting record already exists".into())
                }
                _ if op.is_financial() => self.rederive(&op, op.key(), current, Stage::Primary),
                _ => match current {
                    Some(row) => {
                        let row = self.schema.normalize(op.entity_type, row);
                        self.accept_remote(&op.key(), row)?;
                        self.remote_wins(&op)
                    }
                    None => {
                        self.forget_remote(&op.key());
                        self.remote_wins(&op)
                    }
                },
            },
            RemoteOutcome::NotFound => match op.kind {
                OperationKind::Delete => {
                    self.record_primary(op, step, RemoteOutcome::Applied(None))
                }
                OperationKind::Create => {
                    self.reject(&op.id, format!("{} does not accept inserts", op.entity_type))
                }
                OperationKind::Update if op.is_financial() || op.linked_update.is_some() => {
                    self.reject(&op.id, "record no longer exists remotely".into())
                }
                OperationKind::Update => {
                    self.forget_remote(&op.key());
                    self.remote_wins(&op)
                }
            },
        }
    }

    fn record_linked(
        &mut self,
        op: PendingOperation,
        step: &SyncStep,
        outcome: RemoteOutcome,
    ) -> Result<StepResult> {
        let key = op
            .linked_update
            .as_ref()
            .map(|l| l.key())
            .ok_or_else(|| Error::InvalidOperation(format!("operation {} has no linked update", op.id)))?;

        match outcome {
            RemoteOutcome::Applied(row) => {
                let row = self.response_row(&key, step, row);
                self.accept_remote(&key, row)?;
                self.complete(&op.id)
            }
            RemoteOutcome::Transient(reason) => {
                let max_attempts = self.queue.max_attempts();
                let entry = self.queue.get_mut(&op.id)?;
                entry.attempts += 1;
                entry.last_error = Some(reason.clone());
                let attempts = entry.attempts;
                if attempts >= max_attempts {
                    return self.begin_compensation(&op.id, reason);
                }
                entry.status = OperationStatus::Queued;
                Ok(StepResult::Requeued { attempts })
            }
            RemoteOutcome::Rejected(reason) => self.begin_compensation(&op.id, reason),
            RemoteOutcome::NotFound => {
                self.begin_compensation(&op.id, "linked record no longer exists remotely".into())
            }
            RemoteOutcome::Conflict(current) => self.rederive(&op, key, current, Stage::Linked),
        }
    }

    fn record_compensation(&mut self, op: PendingOperation, outcome: RemoteOutcome) -> Result<StepResult> {
        let key = op.key();
        let reason = op
            .last_error
            .clone()
            .unwrap_or_else(|| "linked update rejected".into());

        match outcome {
            RemoteOutcome::Applied(row) => {
                match (op.kind, row) {
                    (OperationKind::Create, _) => self.forget_remote(&key),
                    (_, Some(row)) => {
                        let row = self.schema.normalize(op.entity_type, row);
                        self.accept_remote(&key, row)?;
                    }
                    (_, None) => {
                        let mut row = self.confirmed_fields(&key).unwrap_or_default();
                        row.extend(op.compensation.clone().unwrap_or_default());
                        self.accept_remote(&key, row)?;
                    }
                }
                self.queue.get_mut(&op.id)?.phase = Phase::Pending;
                self.dead_letter(&op.id, reason)
            }
            RemoteOutcome::NotFound => {
                self.forget_remote(&key);
                self.queue.get_mut(&op.id)?.phase = Phase::Pending;
                self.dead_letter(&op.id, reason)
            }
            RemoteOutcome::Transient(error) => {
                let entry = self.queue.get_mut(&op.id)?;
                entry.attempts += 1;
                entry.status = OperationStatus::Queued;
                tracing::warn!(op_id = %op.id, attempts = entry.attempts, %error, "compensation deferred");
                Ok(StepResult::Requeued {
                    attempts: entry.attempts,
                })
            }
            RemoteOutcome::Rejected(error) => {
                self.queue.get_mut(&op.id)?.phase = Phase::PrimaryCommitted;
                self.dead_letter(&op.id, format!("{reason}; compensation failed: {error}"))
            }
            RemoteOutcome::Conflict(_) => {
                self.queue.get_mut(&op.id)?.phase = Phase::PrimaryCommitted;
                self.dead_letter(&op.id, format!("{reason}; compensation conflicted"))
            }
        }
    }

    fn plan(&self, op: &PendingOperation, stage: Stage) -> Result<SyncStep> {
        let (entity_type, request) = match stage {
            Stage::Primary => {
                let request = match op.kind {
                    OperationKind::Create => {
                        let mut row = op.payload.folded()?;
                        if !op.entity_id.starts_with(TEMP_ID_PREFIX) {
                            row.insert("id".into(), Value::String(op.entity_id.clone()));
                        }
                        RemoteRequest::Insert { row }
                    }
                    OperationKind::Update => self.update_request(&op.key(), &op.payload),
                    OperationKind::Delete => RemoteRequest::Delete {
                        id: op.entity_id.clone(),
                    },
                };
                (op.entity_type, request)
            }
            Stage::Linked => {
                let linked = op.linked_update.as_ref().ok_or_else(|| {
                    Error::InvalidOperation(format!("operation {} has no linked update", op.id))
                })?;
                (
                    linked.entity_type,
                    self.update_request(&linked.key(), &linked.change),
                )
            }
            Stage::Compensate => {
                let previous = op.compensation.clone().unwrap_or_default();
                let request = match op.kind {
                    OperationKind::Create => RemoteRequest::Delete {
                        id: op.entity_id.clone(),
                    },
                    OperationKind::Update => RemoteRequest::Update {
                        id: op.entity_id.clone(),
                        patch: previous,
                        expected_updated_at: None,
                    },
                    OperationKind::Delete => RemoteRequest::Insert { row: previous },
                };
                (op.entity_type, request)
            }
        };

        Ok(SyncStep {
            op_id: op.id.clone(),
            stage,
            entity_type,
            request,
        })
    }

    /// Build an update whose relative adjustments are resolved against the
    /// latest known remote state of the entity.
    fn update_request(&self, key: &EntityKey, change: &Change) -> RemoteRequest {
        let base = self.latest_remote(key);
        let mut patch = change.fields.clone();
        for adj in &change.adjustments {
            let current = patch
                .get(&adj.field)
                .or_else(|| base.as_ref().and_then(|b| b.fields.get(&adj.field)))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            patch.insert(adj.field.clone(), number_value(current + adj.delta));
        }

        RemoteRequest::Update {
            id: key.id.clone(),
            patch,
            expected_updated_at: base.and_then(|b| row_updated_at(&b.fields)),
        }
    }

    /// The confirmed state, or a newer held-back realtime row.
    fn latest_remote(&self, key: &EntityKey) -> Option<Confirmed> {
        let confirmed = self
            .cache
            .get_including_deleted(key.entity_type, &key.id)
            .and_then(|e| e.confirmed.clone());

        match self.listener.held(key) {
            Some((change, at)) if change.event_type != ChangeEventType::Delete => {
                let held_at = change.updated_at(at);
                match confirmed {
                    Some(c) if c.updated_at >= held_at => Some(c),
                    _ => Some(Confirmed {
                        fields: change.row.clone(),
                        updated_at: held_at,
                    }),
                }
            }
            _ => confirmed,
        }
    }

    fn confirmed_fields(&self, key: &EntityKey) -> Option<Fields> {
        self.cache
            .get_including_deleted(key.entity_type, &key.id)
            .and_then(|e| e.confirmed.as_ref())
            .map(|c| c.fields.clone())
    }

    /// Remote state to restore if the primary write has to be undone.
    fn compensation_for(&self, op: &PendingOperation) -> Option<Fields> {
        let previous = self.confirmed_fields(&op.key());
        match op.kind {
            OperationKind::Create => None,
            OperationKind::Update => previous.map(|previous| {
                op.payload
                    .touched_fields()
                    .map(|f| (f.to_string(), previous.get(f).cloned().unwrap_or(Value::Null)))
                    .collect()
            }),
            OperationKind::Delete => previous,
        }
    }

    /// The authoritative row of a successful update; when the backend
    /// returned none it is the confirmed state with the patch applied.
    fn response_row(&self, key: &EntityKey, step: &SyncStep, row: Option<Fields>) -> Fields {
        match row {
            Some(row) => self.schema.normalize(key.entity_type, row),
            None => {
                let mut row = self.confirmed_fields(key).unwrap_or_default();
                if let RemoteRequest::Update { patch, .. } = &step.request {
                    row.extend(patch.clone());
                }
                row
            }
        }
    }

    fn confirm_primary(
        &mut self,
        op: &PendingOperation,
        step: &SyncStep,
        row: Option<Fields>,
    ) -> Result<EntityKey> {
        let mut key = op.key();
        match op.kind {
            OperationKind::Create => {
                let row = match (row, &step.request) {
                    (Some(row), _) => self.schema.normalize(op.entity_type, row),
                    (None, RemoteRequest::Insert { row }) => row.clone(),
                    (None, _) => op.payload.folded()?,
                };
                if let Some(id) = row_id(&row) {
                    if id != op.entity_id {
                        self.replace_id(op.entity_type, &op.entity_id, &id);
                        key.id = id;
                    }
                }
                self.accept_remote(&key, row)?;
            }
            OperationKind::Update => {
                let row = self.response_row(&key, step, row);
                self.accept_remote(&key, row)?;
            }
            OperationKind::Delete => self.forget_remote(&key),
        }
        Ok(key)
    }

    /// Make `row` the confirmed state of an entity.
    fn accept_remote(&mut self, key: &EntityKey, mut row: Fields) -> Result<()> {
        row.entry("id")
            .or_insert_with(|| Value::String(key.id.clone()));
        let entity = match self.cache.get_including_deleted(key.entity_type, &key.id) {
            Some(current) => {
                let mut entity = current.clone();
                entity.confirm(row, self.now);
                entity.id = key.id.clone();
                entity
            }
            None => Entity::from_remote(key.entity_type, row, self.now)?,
        };
        self.cache.put(entity);
        Ok(())
    }

    /// The entity no longer exists remotely.
    fn forget_remote(&mut self, key: &EntityKey) {
        if let Some(current) = self.cache.get_including_deleted(key.entity_type, &key.id) {
            let mut entity = current.clone();
            entity.confirmed = None;
            self.cache.put(entity);
        }
    }

    fn replace_id(&mut self, entity_type: EntityType, temp_id: &str, id: &str) {
        self.cache.replace_id(entity_type, temp_id, id);
        self.cache.rewrite_references(temp_id, id);
        self.queue.remap_entity_id(entity_type, temp_id, id);
        tracing::debug!(%entity_type, %temp_id, %id, "temporary id replaced");
        self.events.push(EngineEvent::EntityIdReplaced {
            entity_type,
            temp_id: temp_id.to_string(),
            id: id.to_string(),
        });
    }

    fn rederive(
        &mut self,
        op: &PendingOperation,
        key: EntityKey,
        current: Option<Fields>,
        stage: Stage,
    ) -> Result<StepResult> {
        let Some(row) = current else {
            return match stage {
                Stage::Linked => self
                    .begin_compensation(&op.id, "linked record no longer exists remotely".into()),
                _ => self.reject(&op.id, "record no longer exists remotely".into()),
            };
        };
        let row = self.schema.normalize(key.entity_type, row);
        self.accept_remote(&key, row)?;
        optimistic::rebase(self.cache, &key, self.queue);

        let max_attempts = self.queue.max_attempts();
        let reason = "conflicting remote change".to_string();
        let entry = self.queue.get_mut(&op.id)?;
        entry.attempts += 1;
        entry.last_error = Some(reason.clone());
        if entry.attempts >= max_attempts {
            return match stage {
                Stage::Linked => self.begin_compensation(&op.id, reason),
                _ => self.dead_letter(&op.id, reason),
            };
        }

        tracing::info!(op_id = %op.id, entity = %key, attempts = entry.attempts, "re-deriving after conflict");
        self.events.push(EngineEvent::ConflictResolved {
            op_id: op.id.clone(),
            entity_type: key.entity_type,
            entity_id: key.id.clone(),
            policy: ConflictPolicy::Rederived,
        });
        let op = self.op(&op.id)?;
        Ok(StepResult::Continue(self.plan(&op, stage)?))
    }

    fn remote_wins(&mut self, op: &PendingOperation) -> Result<StepResult> {
        tracing::info!(op_id = %op.id, entity_type = %op.entity_type, entity_id = %op.entity_id, "conflict resolved, remote wins");
        self.events.push(EngineEvent::ConflictResolved {
            op_id: op.id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            policy: ConflictPolicy::RemoteWins,
        });
        self.complete(&op.id)
    }

    fn begin_compensation(&mut self, op_id: &str, reason: String) -> Result<StepResult> {
        let entry = self.queue.get_mut(op_id)?;
        entry.phase = Phase::Compensating;
        entry.last_error = Some(reason.clone());
        let op = entry.clone();
        for key in op.keys() {
            optimistic::rebase(self.cache, &key, self.queue);
        }

        tracing::warn!(op_id, %reason, "linked update failed, undoing primary write");
        Ok(StepResult::Continue(self.plan(&op, Stage::Compensate)?))
    }

    fn complete(&mut self, op_id: &str) -> Result<StepResult> {
        let op = self.queue.mark_complete(op_id)?;
        self.log.complete(op_id);
        for key in op.keys() {
            self.settle(&key);
        }
        tracing::debug!(op_id, entity_type = %op.entity_type, entity_id = %op.entity_id, "operation confirmed");
        Ok(StepResult::Completed)
    }

    /// Release held-back remote changes once nothing is outstanding on the
    /// entity, then recompute what the UI sees.
    fn settle(&mut self, key: &EntityKey) {
        if !self.queue.has_pending_for(key) {
            if let Some((change, at)) = self.listener.take_held(key) {
                let current = self.cache.get_including_deleted(key.entity_type, &key.id);
                match merge_remote(current, &change, at) {
                    Ok(Merge::Upsert(entity)) => self.cache.put(entity),
                    Ok(Merge::Remove) => {
                        self.cache.remove(key.entity_type, &key.id);
                    }
                    Ok(Merge::Stale) => {}
                    Err(e) => tracing::warn!(entity = %key, error = %e, "dropping held remote change"),
                }
            }
        }
        optimistic::rebase(self.cache, key, self.queue);
        self.events.push(EngineEvent::EntityUpdated {
            entity_type: key.entity_type,
            id: key.id.clone(),
        });
    }

    fn retry_later(&mut self, op_id: &str, reason: String) -> Result<StepResult> {
        match self.queue.mark_failed(op_id, true, reason.clone())? {
            FailureOutcome::Requeued { attempts } => {
                tracing::debug!(op_id, attempts, %reason, "operation requeued");
                Ok(StepResult::Requeued { attempts })
            }
            FailureOutcome::DeadLettered { .. } => self.dead_lettered(op_id, reason),
        }
    }

    fn reject(&mut self, op_id: &str, reason: String) -> Result<StepResult> {
        self.queue.mark_failed(op_id, false, reason.clone())?;
        self.dead_lettered(op_id, reason)
    }

    pub(crate) fn dead_letter(&mut self, op_id: &str, reason: String) -> Result<StepResult> {
        self.queue.dead_letter(op_id, reason.clone())?;
        self.dead_lettered(op_id, reason)
    }

    /// Revert the optimistic effects of a dead-lettered operation and
    /// surface it.
    fn dead_lettered(&mut self, op_id: &str, reason: String) -> Result<StepResult> {
        let op = self.op(op_id)?;
        for key in op.keys() {
            self.settle(&key);
        }

        tracing::warn!(
            op_id,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            attempts = op.attempts,
            %reason,
            "operation dead-lettered"
        );
        self.events.push(EngineEvent::OperationDeadLettered {
            op_id: op.id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            reason: reason.clone(),
        });
        Ok(StepResult::DeadLettered { reason })
    }

    fn op(&self, op_id: &str) -> Result<PendingOperation> {
        self.queue
            .get(op_id)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(op_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{LinkedUpdate, Mutation};
    use crate::realtime::RemoteChange;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    struct Harness {
        cache: LocalCacheStore,
        queue: PendingQueue,
        log: AppliedLog,
        listener: ChangeListener,
        events: Vec<EngineEvent>,
        schema: Schema,
        seq: u64,
    }

    impl Harness {
        fn new() -> Self {
            let mut cache = LocalCacheStore::open(Box::new(MemoryStorage::new()));
            cache.put(
                Entity::from_remote(
                    EntityType::Customer,
                    fields(json!({"id": "c-1", "name": "Amina", "outstandingDebt": 500, "updatedAt": 100})),
                    100,
                )
                .unwrap(),
            );
            Self {
                cache,
                queue: PendingQueue::new(3),
                log: AppliedLog::default(),
                listener: ChangeListener::default(),
                events: Vec::new(),
                schema: Schema::shop(),
                seq: 0,
            }
        }

        fn reconciler(&mut self) -> Reconciler<'_> {
            Reconciler {
                cache: &mut self.cache,
                queue: &mut self.queue,
                log: &mut self.log,
                listener: &mut self.listener,
                events: &mut self.events,
                schema: &self.schema,
                now: 10_000,
            }
        }

        fn submit(&mut self, mutation: Mutation) -> OperationId {
            self.seq += 1;
            let op = mutation
                .into_operation(format!("op-{}", self.seq), self.seq, self.seq * 1000)
                .unwrap();
            optimistic::apply(&mut self.cache, &mut self.log, &op, op.created_at).unwrap();
            let id = op.id.clone();
            self.queue.enqueue(op);
            id
        }

        fn debt(&self) -> Value {
            self.cache.get_entity(EntityType::Customer, "c-1").unwrap().fields["outstandingDebt"].clone()
        }
    }

    fn payment(amount: f64) -> Mutation {
        Mutation::update(EntityType::Customer, "c-1", Change::adjust("outstandingDebt", -amount))
    }

    #[test]
    fn update_is_sent_as_absolute_value_from_remote_base() {
        let mut h = Harness::new();
        let id = h.submit(payment(200.0));

        let step = h.reconciler().start(&id).unwrap();
        assert_eq!(step.stage, Stage::Primary);
        assert_eq!(
            step.request,
            RemoteRequest::Update {
                id: "c-1".into(),
                patch: fields(json!({"outstandingDebt": 300})),
                expected_updated_at: Some(100),
            }
        );
    }

    #[test]
    fn held_realtime_row_is_the_base() {
        let mut h = Harness::new();
        let id = h.submit(payment(200.0));
        h.listener
            .receive(
                RemoteChange::new(
                    EntityType::Customer,
                    ChangeEventType::Update,
                    fields(json!({"id": "c-1", "name": "Amina", "outstandingDebt": 350, "updatedAt": 200})),
                ),
                true,
                5000,
            )
            .unwrap();

        let step = h.reconciler().start(&id).unwrap();
        let RemoteRequest::Update { patch, expected_updated_at, .. } = step.request else {
            panic!("expected update");
        };
        assert_eq!(patch["outstandingDebt"], json!(150));
        assert_eq!(expected_updated_at, Some(200));
    }

    #[test]
    fn applied_update_completes_and_confirms() {
        let mut h = Harness::new();
        let id = h.submit(payment(200.0));
        let step = h.reconciler().start(&id).unwrap();

        let row = fields(json!({"id": "c-1", "name": "Amina", "outstanding_debt": 300, "updated_at": 300}));
        let result = h.reconciler().record(&step, RemoteOutcome::Applied(Some(row))).unwrap();

        assert_eq!(result, StepResult::Completed);
        assert!(h.queue.is_empty());
        assert_eq!(h.debt(), json!(300));
        let entity = h.cache.get_entity(EntityType::Customer, "c-1").unwrap();
        assert!(entity.is_synced());
        assert_eq!(entity.confirmed_at(), Some(300));
    }

    #[test]
    fn financial_conflict_is_rederived() {
        let mut h = Harness::new();
        let id = h.submit(payment(200.0));
        let step = h.reconciler().start(&id).unwrap();

        let current = fields(json!({"id": "c-1", "name": "Amina", "outstandingDebt": 350, "updatedAt": 200}));
        let result = h.reconciler().record(&step, RemoteOutcome::Conflict(Some(current))).unwrap();

        let StepResult::Continue(next) = result else {
            panic!("expected a retry step, got {result:?}");
        };
        let RemoteRequest::Update { patch, .. } = &next.request else {
            panic!("expected update");
        };
        assert_eq!(patch["outstandingDebt"], json!(150));
        assert_eq!(h.debt(), json!(150));
        assert!(h.events.iter().any(|e| matches!(
            e,
            EngineEvent::ConflictResolved { policy: ConflictPolicy::Rederived, .. }
        )));
    }

    #[test]
    fn cosmetic_conflict_lets_remote_win() {
        let mut h = Harness::new();
        let id = h.submit(Mutation::update(
            EntityType::Customer,
            "c-1",
            Change::set(fields(json!({"name": "Amina K"}))),
        ));
        let step = h.reconciler().start(&id).unwrap();

        let current = fields(json!({"id": "c-1", "name": "Amina W", "outstandingDebt": 500, "updatedAt": 200}));
        let result = h.reconciler().record(&step, RemoteOutcome::Conflict(Some(current))).unwrap();

        assert_eq!(result, StepResult::Completed);
        let entity = h.cache.get_entity(EntityType::Customer, "c-1").unwrap();
        assert_eq!(entity.fields["name"], json!("Amina W"));
        assert!(entity.is_synced());
    }

    #[test]
    fn rejection_dead_letters_and_reverts() {
        let mut h = Harness::new();
        let id = h.submit(payment(200.0));
        assert_eq!(h.debt(), json!(300));
        let step = h.reconciler().start(&id).unwrap();

        let result = h
            .reconciler()
            .record(&step, RemoteOutcome::Rejected("amount must be positive".into()))
            .unwrap();

        assert!(matches!(result, StepResult::DeadLettered { .. }));
        assert_eq!(h.debt(), json!(500));
        assert_eq!(h.queue.dead_lettered().count(), 1);
    }

    #[test]
    fn transient_failure_requeues() {
        let mut h = Harness::new();
        let id = h.submit(payment(200.0));
        let step = h.reconciler().start(&id).unwrap();

        let result = h.reconciler().record(&step, RemoteOutcome::Transient("timeout".into())).unwrap();
        assert_eq!(result, StepResult::Requeued { attempts: 1 });
        assert_eq!(h.debt(), json!(300));
        assert_eq!(h.queue.ready(10), vec![id]);
    }

    #[test]
    fn create_gets_server_id() {
        let mut h = Harness::new();
        let id = h.submit(Mutation::create(EntityType::Product, fields(json!({"name": "Soap"}))));
        let step = h.reconciler().start(&id).unwrap();
        assert_eq!(
            step.request,
            RemoteRequest::Insert {
                row: fields(json!({"name": "Soap"}))
            }
        );

        let row = fields(json!({"id": "p-42", "name": "Soap", "updatedAt": 300}));
        h.reconciler().record(&step, RemoteOutcome::Applied(Some(row))).unwrap();

        assert!(h.cache.get_entity(EntityType::Product, "temp-op-1").is_none());
        assert!(h.cache.get_entity(EntityType::Product, "p-42").unwrap().is_synced());
        assert!(h.events.contains(&EngineEvent::EntityIdReplaced {
            entity_type: EntityType::Product,
            temp_id: "temp-op-1".into(),
            id: "p-42".into(),
        }));
    }

    #[test]
    fn linked_update_runs_after_primary_commits() {
        let mut h = Harness::new();
        let id = h.submit(
            Mutation::create(EntityType::Sale, fields(json!({"total": 500, "customerId": "c-1"})))
                .with_linked(LinkedUpdate::new(
                    EntityType::Customer,
                    "c-1",
                    Change::adjust("outstandingDebt", 500.0),
                )),
        );
        assert_eq!(h.debt(), json!(1000));

        let step = h.reconciler().start(&id).unwrap();
        let row = fields(json!({"id": "s-1", "total": 500, "customerId": "c-1", "updatedAt": 300}));
        let StepResult::Continue(linked) = h.reconciler().record(&step, RemoteOutcome::Applied(Some(row))).unwrap() else {
            panic!("expected linked step");
        };
        assert_eq!(linked.stage, Stage::Linked);
        assert_eq!(h.queue.get(&id).unwrap().phase, Phase::PrimaryCommitted);
        assert_eq!(h.debt(), json!(1000));

        // A transient failure resumes at the linked stage
        h.reconciler().record(&linked, RemoteOutcome::Transient("offline".into())).unwrap();
        let resumed = h.reconciler().start(&id).unwrap();
        assert_eq!(resumed.stage, Stage::Linked);

        let customer = fields(json!({"id": "c-1", "name": "Amina", "outstandingDebt": 1000, "updatedAt": 400}));
        let result = h.reconciler().record(&resumed, RemoteOutcome::Applied(Some(customer))).unwrap();
        assert_eq!(result, StepResult::Completed);
        assert_eq!(h.debt(), json!(1000));
        assert!(h.cache.get_entity(EntityType::Sale, "s-1").unwrap().is_synced());
    }

    #[test]
    fn rejected_linked_update_compensates_primary() {
        let mut h = Harness::new();
        let id = h.submit(
            Mutation::create(EntityType::Sale, fields(json!({"total": 500})))
                .with_linked(LinkedUpdate::new(
                    EntityType::Customer,
                    "c-1",
                    Change::adjust("outstandingDebt", 500.0),
                )),
        );
        let step = h.reconciler().start(&id).unwrap();
        let row = fields(json!({"id": "s-1", "total": 500, "updatedAt": 300}));
        let StepResult::Continue(linked) = h.reconciler().record(&step, RemoteOutcome::Applied(Some(row))).unwrap() else {
            panic!("expected linked step");
        };

        let StepResult::Continue(undo) = h
            .reconciler()
            .record(&linked, RemoteOutcome::Rejected("credit limit".into()))
            .unwrap()
        else {
            panic!("expected compensation step");
        };
        assert_eq!(undo.stage, Stage::Compensate);
        assert_eq!(undo.request, RemoteRequest::Delete { id: "s-1".into() });

        let result = h.reconciler().record(&undo, RemoteOutcome::Applied(None)).unwrap();
        assert_eq!(
            result,
            StepResult::DeadLettered {
                reason: "credit limit".into()
            }
        );
        // Neither side shows the sale
        assert_eq!(h.debt(), json!(500));
        assert!(h.cache.is_empty(EntityType::Sale));
        assert_eq!(h.queue.get(&id).unwrap().phase, Phase::Pending);
    }

    #[test]
    fn recording_requires_in_flight() {
        let mut h = Harness::new();
        let id = h.submit(payment(1.0));
        let step = SyncStep {
            op_id: id,
            stage: Stage::Primary,
            entity_type: EntityType::Customer,
            request: RemoteRequest::Delete { id: "c-1".into() },
        };
        assert!(h.reconciler().record(&step, RemoteOutcome::NotFound).is_err());
    }
}
