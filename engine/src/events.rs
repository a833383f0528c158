//! Named signals the engine emits for the rest of the application.
//!
//! Events accumulate in an outbox that the host drains with
//! [`Engine::drain_events`](crate::Engine::drain_events) and forwards to
//! whoever listens (a notification banner, the UI websocket).

use crate::{entity::EntityType, EntityId, OperationId};
use serde::{Deserialize, Serialize};

/// How a conflict rejection was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// The remote record was accepted and the local delta discarded
    RemoteWins,
    /// The relative change was re-derived from the latest remote state and retried
    Rederived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    EntityUpdated {
        entity_type: EntityType,
        id: EntityId,
    },
    /// A temporary id was replaced by the backend-assigned one
    #[serde(rename_all = "camelCase")]
    EntityIdReplaced {
        entity_type: EntityType,
        temp_id: EntityId,
        id: EntityId,
    },
    /// A drain pass ended
    #[serde(rename_all = "camelCase")]
    SyncCompleted { completed: usize, remaining: usize },
    #[serde(rename_all = "camelCase")]
    OperationDeadLettered {
        op_id: OperationId,
        entity_type: EntityType,
        entity_id: EntityId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        op_id: OperationId,
        entity_type: EntityType,
        entity_id: EntityId,
        policy: ConflictPolicy,
    },
    #[serde(rename_all = "camelCase")]
    ConnectivityChanged { online: bool },
}

impl EngineEvent {
    /// Short name, used as a log field.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::EntityUpdated { .. } => "entityUpdated",
            EngineEvent::EntityIdReplaced { .. } => "entityIdReplaced",
            EngineEvent::SyncCompleted { .. } => "syncCompleted",
            EngineEvent::OperationDeadLettered { .. } => "operationDeadLettered",
            EngineEvent::ConflictResolved { .. } => "conflictResolved",
            EngineEvent::ConnectivityChanged { .. } => "connectivityChanged",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_with_type_tag() {
        let event = EngineEvent::OperationDeadLettered {
            op_id: "till-1-3".into(),
            entity_type: EntityType::Sale,
            entity_id: "temp-till-1-3".into(),
            reason: "invalid total".into(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "operationDeadLettered");
        assert_eq!(json["opId"], "till-1-3");
        assert_eq!(json["entityType"], "sale");
        assert_eq!(event.name(), "operationDeadLettered");
    }

    #[test]
    fn conflict_policy_format() {
        let event = EngineEvent::ConflictResolved {
            op_id: "op".into(),
            entity_type: EntityType::Customer,
            entity_id: "c-1".into(),
            policy: ConflictPolicy::Rederived,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"policy\":\"rederived\""));
        assert_eq!(serde_json::from_str::<EngineEvent>(&json).unwrap(), event);
    }
}
