//! Pending operation queue.
//!
//! An ordered log of deferred mutations. Operations are kept in enqueue
//! order; draining picks by priority first and creation time second, but
//! never lets an operation overtake an earlier one that touches the same
//! entity.

use crate::{
    entity::{EntityKey, EntityType},
    error::Result,
    operation::{OperationKind, OperationStatus, PendingOperation},
    Error, OperationId,
};

/// Default number of attempts before an operation is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What [`PendingQueue::enqueue`] did with an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Added at the end of the queue
    Appended(OperationId),
    /// Merged into an operation that was already queued
    Coalesced { into: OperationId },
    /// A delete cancelled a create that was never sent; both are gone
    Cancelled { create_op: OperationId },
}

/// What [`PendingQueue::mark_failed`] did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { attempts: u32 },
    DeadLettered { attempts: u32 },
}

/// Ordered, coalescing log of pending operations.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    /// Enqueue order
    ops: Vec<PendingOperation>,
    max_attempts: u32,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl PendingQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            ops: Vec::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Restore a queue from persisted operations.
    pub fn from_ops(ops: Vec<PendingOperation>, max_attempts: u32) -> Self {
        let mut queue = Self::new(max_attempts);
        queue.ops = ops;
        queue.ops.sort_by_key(|op| op.seq);
        queue
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Add an operation, coalescing it with a queued one where possible.
    ///
    /// Only the most recent live operation on the target entity is a
    /// coalescing candidate, and only while it is still queued, so merging
    /// never moves an effect ahead of another operation on the same entity.
    pub fn enqueue(&mut self, op: PendingOperation) -> EnqueueOutcome {
        if let Some(index) = self.coalescing_candidate(&op) {
            if let Some(outcome) = self.coalesce(index, &op) {
                return outcome;
            }
        }
        let id = op.id.clone();
        self.ops.push(op);
        EnqueueOutcome::Appended(id)
    }

    fn coalescing_candidate(&self, op: &PendingOperation) -> Option<usize> {
        let key = op.key();
        let index = self.last_live_touching(&key)?;
        let candidate = &self.ops[index];
        if candidate.status != OperationStatus::Queued || candidate.key() != key {
            return None;
        }
        // A linked target must not have been touched after the candidate
        if let Some(linked) = &op.linked_update {
            if self.last_live_touching(&linked.key()) != Some(index) {
                return None;
            }
        }
        Some(index)
    }

    fn coalesce(&mut self, index: usize, op: &PendingOperation) -> Option<EnqueueOutcome> {
        let candidate = &mut self.ops[index];
        match (candidate.kind, op.kind) {
            (OperationKind::Update, OperationKind::Update) => {
                match (&mut candidate.linked_update, &op.linked_update) {
                    (None, None) => {}
                    (Some(existing), Some(newer)) if existing.key() == newer.key() => {
                        existing.change.merge(newer.change.clone());
                    }
                    _ => return None,
                }
                candidate.payload.merge(op.payload.clone());
                candidate.priority = candidate.priority.max(op.priority);
                Some(EnqueueOutcome::Coalesced {
                    into: candidate.id.clone(),
                })
            }
            (OperationKind::Create, OperationKind::Update) if op.linked_update.is_none() => {
                let mut merged = candidate.payload.clone();
                merged.merge(op.payload.clone());
                let fields = merged.folded().ok()?;
                candidate.payload = crate::operation::Change::set(fields);
                candidate.priority = candidate.priority.max(op.priority);
                Some(EnqueueOutcome::Coalesced {
                    into: candidate.id.clone(),
                })
            }
            (OperationKind::Create, OperationKind::Delete) if candidate.linked_update.is_none() => {
                let removed = self.ops.remove(index);
                Some(EnqueueOutcome::Cancelled {
                    create_op: removed.id,
                })
            }
            (OperationKind::Update, OperationKind::Delete) if candidate.linked_update.is_none() => {
                candidate.kind = OperationKind::Delete;
                candidate.payload = Default::default();
                candidate.priority = candidate.priority.max(op.priority);
                Some(EnqueueOutcome::Coalesced {
                    into: candidate.id.clone(),
                })
            }
            _ => None,
        }
    }

    fn last_live_touching(&self, key: &EntityKey) -> Option<usize> {
        self.ops
            .iter()
            .rposition(|op| op.is_live() && op.touches(key))
    }

    /// Whether an operation may start now: it is queued, nothing it touches
    /// is in flight, and no earlier live operation touches the same entities.
    fn is_ready(&self, index: usize) -> bool {
        let op = &self.ops[index];
        if op.status != OperationStatus::Queued {
            return false;
        }
        let keys = op.keys();
        let blocked = |other: &PendingOperation| {
            other.is_live() && keys.iter().any(|k| other.touches(k))
        };
        !self.ops[..index].iter().any(blocked)
            && !self.ops[index + 1..]
                .iter()
                .any(|o| o.status == OperationStatus::InFlight && blocked(o))
    }

    /// Queued operations in priority-then-FIFO order.
    ///
    /// The order is computed on each call; recompute after the queue changes.
    pub fn drain_order(&self) -> impl Iterator<Item = &PendingOperation> {
        let mut queued: Vec<&PendingOperation> = self
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Queued)
            .collect();
        queued.sort_by_key(|op| op.drain_key());
        queued.into_iter()
    }

    /// Up to `limit` operations that can be sent right now, in drain order.
    /// No two of them touch the same entity.
    pub fn ready(&self, limit: usize) -> Vec<OperationId> {
        let mut ready: Vec<(usize, &PendingOperation)> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(index, _)| self.is_ready(*index))
            .collect();
        ready.sort_by_key(|(_, op)| op.drain_key());
        ready
            .into_iter()
            .take(limit)
            .map(|(_, op)| op.id.clone())
            .collect()
    }

    /// Take the next ready operation and mark it in flight.
    pub fn dequeue_next(&mut self) -> Option<PendingOperation> {
        let id = self.ready(1).into_iter().next()?;
        self.mark_in_flight(&id).ok()?;
        self.get(&id).cloned()
    }

    pub fn mark_in_flight(&mut self, id: &str) -> Result<()> {
        let op = self.get_mut(id)?;
        if op.status != OperationStatus::Queued {
            return Err(Error::InvalidOperation(format!(
                "operation {id} is {:?}, not queued",
                op.status
            )));
        }
        op.status = OperationStatus::InFlight;
        Ok(())
    }

    /// Remove a confirmed operation.
    pub fn mark_complete(&mut self, id: &str) -> Result<PendingOperation> {
        let index = self.index_of(id)?;
        Ok(self.ops.remove(index))
    }

    /// Record a failed attempt. Non-retryable failures and exhausted
    /// retries dead-letter the operation.
    pub fn mark_failed(
        &mut self,
        id: &str,
        retryable: bool,
        error: impl Into<String>,
    ) -> Result<FailureOutcome> {
        let max_attempts = self.max_attempts;
        let op = self.get_mut(id)?;
        op.attempts += 1;
        op.last_error = Some(error.into());

        if !retryable || op.attempts >= max_attempts {
            op.status = OperationStatus::DeadLettered;
            Ok(FailureOutcome::DeadLettered {
                attempts: op.attempts,
            })
        } else {
            op.status = OperationStatus::Queued;
            Ok(FailureOutcome::Requeued {
                attempts: op.attempts,
            })
        }
    }

    /// Return an operation to the queue without counting an attempt, e.g.
    /// when the drain stops because connectivity was lost.
    pub fn release(&mut self, id: &str) -> Result<()> {
        let op = self.get_mut(id)?;
        if op.status == OperationStatus::InFlight {
            op.status = OperationStatus::Queued;
        }
        Ok(())
    }

    /// Dead-letter an operation immediately.
    pub fn dead_letter(&mut self, id: &str, reason: impl Into<String>) -> Result<()> {
        let op = self.get_mut(id)?;
        op.status = OperationStatus::DeadLettered;
        op.last_error = Some(reason.into());
        Ok(())
    }

    /// Put a dead-lettered operation back in the queue with fresh attempts.
    pub fn retry_dead_lettered(&mut self, id: &str) -> Result<()> {
        let op = self.get_mut(id)?;
        if op.status != OperationStatus::DeadLettered {
            return Err(Error::InvalidOperation(format!(
                "operation {id} is not dead-lettered"
            )));
        }
        op.status = OperationStatus::Queued;
        op.attempts = 0;
        op.last_error = None;
        Ok(())
    }

    /// Remove a dead-lettered operation for good.
    pub fn discard(&mut self, id: &str) -> Result<PendingOperation> {
        let index = self.index_of(id)?;
        if self.ops[index].status != OperationStatus::DeadLettered {
            return Err(Error::InvalidOperation(format!(
                "operation {id} is not dead-lettered"
            )));
        }
        Ok(self.ops.remove(index))
    }

    /// Point every queued reference to a temporary id at the real one.
    pub fn remap_entity_id(&mut self, entity_type: EntityType, old: &str, new: &str) {
        for op in &mut self.ops {
            op.remap_id(entity_type, old, new);
        }
    }

    /// Whether a live (queued or in-flight) operation touches an entity.
    pub fn has_pending_for(&self, key: &EntityKey) -> bool {
        self.ops.iter().any(|op| op.is_live() && op.touches(key))
    }

    /// Every operation touching an entity, in enqueue order.
    pub fn ops_for<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a PendingOperation> {
        self.ops.iter().filter(move |op| op.touches(key))
    }

    pub fn get(&self, id: &str) -> Option<&PendingOperation> {
        self.ops.iter().find(|op| op.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Result<&mut PendingOperation> {
        self.ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.ops
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    /// All operations in enqueue order, dead letters included.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.iter()
    }

    pub fn dead_lettered(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.iter().filter(|op| !op.is_live())
    }

    /// Number of operations not dead-lettered.
    pub fn pending_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn to_vec(&self) -> Vec<PendingOperation> {
        self.ops.clone()
    }
}
