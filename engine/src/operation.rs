//! Operation types for expressing deferred mutations.
//!
//! The UI expresses intent as a [`Mutation`]. The engine turns it into a
//! [`PendingOperation`] that is applied optimistically and kept in the queue
//! until the remote backend confirms it.

use crate::{
    entity::{EntityKey, EntityType, Fields},
    error::Result,
    EntityId, Error, OperationId, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Drain priority. Higher drains first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Cosmetic edits that can wait behind everything else
    Low,
    #[default]
    Normal,
    /// Debt, payment and balance mutations
    Financial,
}

/// Queue status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    #[default]
    Queued,
    InFlight,
    /// Abandoned; needs user attention
    DeadLettered,
}

/// How far a composite operation got remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Pending,
    /// The primary write landed; only the linked update remains
    PrimaryCommitted,
    /// The linked update was rejected; the primary write is being undone
    Compensating,
}

/// A relative numeric change, e.g. "reduce balance by 200".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjustment {
    pub field: String,
    pub delta: f64,
}

/// Field values to set plus numeric adjustments to apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde(default)]
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<Adjustment>,
}

impl Change {
    /// A change that sets the given fields.
    pub fn set(fields: Fields) -> Self {
        Self {
            fields,
            adjustments: Vec::new(),
        }
    }

    /// A change that adjusts one numeric field.
    pub fn adjust(field: impl Into<String>, delta: f64) -> Self {
        Self::default().with_adjustment(field, delta)
    }

    /// Add an adjustment, summing with an existing one on the same field.
    pub fn with_adjustment(mut self, field: impl Into<String>, delta: f64) -> Self {
        let field = field.into();
        match self.adjustments.iter_mut().find(|a| a.field == field) {
            Some(existing) => existing.delta += delta,
            None => self.adjustments.push(Adjustment { field, delta }),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.adjustments.is_empty()
    }

    /// Merge a newer change into this one. Newer field values win; an
    /// adjustment on a field that is already set absolutely is folded into
    /// that value, otherwise adjustments on the same field are summed.
    pub fn merge(&mut self, newer: Change) {
        for (field, value) in newer.fields {
            self.adjustments.retain(|a| a.field != field);
            self.fields.insert(field, value);
        }

        for adj in newer.adjustments {
            if let Some(base) = self.fields.get(&adj.field).and_then(Value::as_f64) {
                self.fields
                    .insert(adj.field.clone(), number_value(base + adj.delta));
                continue;
            }
            match self.adjustments.iter_mut().find(|a| a.field == adj.field) {
                Some(existing) => existing.delta += adj.delta,
                None => self.adjustments.push(adj),
            }
        }
    }

    /// Apply this change on top of existing fields.
    pub fn apply_to(&self, target: &mut Fields) -> Result<()> {
        for (field, value) in &self.fields {
            target.insert(field.clone(), value.clone());
        }
        for adj in &self.adjustments {
            let base = match target.get(&adj.field) {
                None | Some(Value::Null) => 0.0,
                Some(v) => v.as_f64().ok_or_else(|| Error::TypeMismatch {
                    field: adj.field.clone(),
                    expected: "Float".into(),
                    got: "non-numeric".into(),
                })?,
            };
            target.insert(adj.field.clone(), number_value(base + adj.delta));
        }
        Ok(())
    }

    /// The absolute field values, with adjustments applied to a zero base.
    pub fn folded(&self) -> Result<Fields> {
        let mut fields = Fields::new();
        self.apply_to(&mut fields)?;
        Ok(fields)
    }

    /// Names of every field this change writes.
    pub fn touched_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .chain(self.adjustments.iter().map(|a| a.field.as_str()))
    }

    fn replace_references(&mut self, old: &str, new: &str) {
        for value in self.fields.values_mut() {
            replace_string(value, old, new);
        }
    }
}

/// Encode a number, keeping whole values as integers.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn replace_string(value: &mut Value, old: &str, new: &str) {
    match value {
        Value::String(s) if s == old => *s = new.to_string(),
        Value::Array(items) => items.iter_mut().for_each(|v| replace_string(v, old, new)),
        Value::Object(map) => map.values_mut().for_each(|v| replace_string(v, old, new)),
        _ => {}
    }
}

/// A secondary change applied atomically with the primary one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedUpdate {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub change: Change,
}

impl LinkedUpdate {
    pub fn new(entity_type: EntityType, entity_id: impl Into<EntityId>, change: Change) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            change,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// A mutation intent issued by the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub entity_type: EntityType,
    pub kind: OperationKind,
    /// Target id; optional for creates
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    #[serde(default)]
    pub change: Change,
    #[serde(default)]
    pub linked_update: Option<LinkedUpdate>,
    /// Overrides the default priority
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl Mutation {
    pub fn create(entity_type: EntityType, fields: Fields) -> Self {
        Self {
            entity_type,
            kind: OperationKind::Create,
            entity_id: None,
            change: Change::set(fields),
            linked_update: None,
            priority: None,
        }
    }

    pub fn update(entity_type: EntityType, id: impl Into<EntityId>, change: Change) -> Self {
        Self {
            entity_type,
            kind: OperationKind::Update,
            entity_id: Some(id.into()),
            change,
            linked_update: None,
            priority: None,
        }
    }

    pub fn delete(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            kind: OperationKind::Delete,
            entity_id: Some(id.into()),
            change: Change::default(),
            linked_update: None,
            priority: None,
        }
    }

    /// Use a specific id for a create.
    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn with_linked(mut self, linked: LinkedUpdate) -> Self {
        self.linked_update = Some(linked);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Priority used when none is given explicitly.
    pub fn default_priority(&self) -> Priority {
        let adjusts = !self.change.adjustments.is_empty()
            || self
                .linked_update
                .as_ref()
                .is_some_and(|l| !l.change.adjustments.is_empty());
        if self.entity_type.is_financial() || adjusts || self.linked_update.is_some() {
            Priority::Financial
        } else {
            Priority::Normal
        }
    }

    /// Turn the intent into a queueable operation.
    pub fn into_operation(
        self,
        id: impl Into<OperationId>,
        seq: u64,
        created_at: Timestamp,
    ) -> Result<PendingOperation> {
        let id = id.into();
        let priority = self.priority.unwrap_or_else(|| self.default_priority());
        let entity_id = match (self.kind, self.entity_id) {
            (_, Some(entity_id)) if !entity_id.is_empty() => entity_id,
            (OperationKind::Create, _) => format!("{}{}", crate::TEMP_ID_PREFIX, id),
            (kind, _) => {
                return Err(Error::InvalidOperation(format!(
                    "{kind:?} on {} requires an entity id",
                    self.entity_type
                )))
            }
        };
        if self.kind == OperationKind::Delete && !self.change.is_empty() {
            return Err(Error::InvalidOperation("delete carries no payload".into()));
        }

        Ok(PendingOperation {
            id,
            entity_type: self.entity_type,
            entity_id,
            kind: self.kind,
            payload: self.change,
            priority,
            created_at,
            seq,
            attempts: 0,
            status: OperationStatus::Queued,
            phase: Phase::Pending,
            linked_update: self.linked_update,
            compensation: None,
            last_error: None,
        })
    }
}

/// One deferred mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    /// Full record for create, partial diff for update, empty for delete
    pub payload: Change,
    pub priority: Priority,
    pub created_at: Timestamp,
    /// Enqueue order, the FIFO tie-breaker
    pub seq: u64,
    pub attempts: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_update: Option<LinkedUpdate>,
    /// Remote state to restore if the primary write must be undone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Key of the primary target.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Every entity this operation touches.
    pub fn keys(&self) -> Vec<EntityKey> {
        let mut keys = vec![self.key()];
        if let Some(linked) = &self.linked_update {
            keys.push(linked.key());
        }
        keys
    }

    pub fn touches(&self, key: &EntityKey) -> bool {
        (self.entity_type == key.entity_type && self.entity_id == key.id)
            || self
                .linked_update
                .as_ref()
                .is_some_and(|l| l.entity_type == key.entity_type && l.entity_id == key.id)
    }

    /// Not dead-lettered.
    pub fn is_live(&self) -> bool {
        self.status != OperationStatus::DeadLettered
    }

    /// Financial operations are re-derived on conflict instead of dropped.
    pub fn is_financial(&self) -> bool {
        self.priority == Priority::Financial
            || !self.payload.adjustments.is_empty()
            || self
                .linked_update
                .as_ref()
                .is_some_and(|l| !l.change.adjustments.is_empty())
    }

    /// The change this operation makes to `key`, if any.
    pub fn change_for(&self, key: &EntityKey) -> Option<&Change> {
        if self.entity_type == key.entity_type && self.entity_id == key.id {
            return Some(&self.payload);
        }
        self.linked_update
            .as_ref()
            .filter(|l| l.entity_type == key.entity_type && l.entity_id == key.id)
            .map(|l| &l.change)
    }

    /// Ordering key for draining: priority first, then FIFO.
    pub fn drain_key(&self) -> (Reverse<Priority>, Timestamp, u64) {
        (Reverse(self.priority), self.created_at, self.seq)
    }

    /// Point every reference to `old` at `new`: the targets and any field
    /// value equal to the old id (e.g. a sale's `customerId`).
    pub fn remap_id(&mut self, entity_type: EntityType, old: &str, new: &str) {
        if self.entity_type == entity_type && self.entity_id == old {
            self.entity_id = new.to_string();
        }
        self.payload.replace_references(old, new);
        if let Some(linked) = &mut self.linked_update {
            if linked.entity_type == entity_type && linked.entity_id == old {
                linked.entity_id = new.to_string();
            }
            linked.change.replace_references(old, new);
        }
    }
}
