//! Durable layouts of engine state.
//!
//! Each snapshot is stored as one JSON blob under its own storage key and
//! carries a format version so older builds refuse data they cannot read.

use crate::{
    entity::{Entity, EntityType},
    error::Result,
    operation::{OperationStatus, PendingOperation},
    optimistic::AppliedLog,
    sequence::OpSequence,
    Error,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

trait Versioned: Serialize + DeserializeOwned {
    fn format_version(&self) -> u32;

    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version() > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version(),
                SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// One cached collection, stored under `cache:<table>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub format_version: u32,
    pub entity_type: EntityType,
    /// Entities in cache order, tombstones included
    pub entities: Vec<Entity>,
}

impl Versioned for CollectionSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl CollectionSnapshot {
    pub fn new(entity_type: EntityType, entities: Vec<Entity>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            entity_type,
            entities,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Versioned::to_json(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        <Self as Versioned>::from_json(json)
    }
}

/// The pending operation queue, stored under `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub format_version: u32,
    /// Id generator state, so ids are never reused after a restart
    pub sequence: OpSequence,
    /// Operations in enqueue order
    pub operations: Vec<PendingOperation>,
}

impl Versioned for QueueSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl QueueSnapshot {
    pub fn new(sequence: OpSequence, operations: Vec<PendingOperation>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            sequence,
            operations,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Versioned::to_json(self)
    }

    /// Decode a persisted queue.
    ///
    /// Operations that were in flight when the process stopped are queued
    /// again: their outcome is unknown and the retry is the only way to
    /// learn it.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut snapshot = <Self as Versioned>::from_json(json)?;
        for op in &mut snapshot.operations {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Queued;
            }
            snapshot.sequence.observe(op.seq);
        }
        Ok(snapshot)
    }

    pub fn pending_count(&self) -> usize {
        self.operations.iter().filter(|op| op.is_live()).count()
    }
}

/// The idempotency log, stored under `applied`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedSnapshot {
    pub format_version: u32,
    pub log: AppliedLog,
}

impl Versioned for AppliedSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl AppliedSnapshot {
    pub fn new(log: AppliedLog) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            log,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Versioned::to_json(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        <Self as Versioned>::from_json(json)
    }
}
