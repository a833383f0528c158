//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by a snake_case `type`; payloads
//! borrowed from the engine keep its camelCase field names.

use serde::{Deserialize, Serialize};
use shopsync_engine::{CacheChange, EngineEvent, Entity, Mutation};

/// Messages sent from the UI to the agent.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Apply a mutation intent.
    Mutate {
        mutation: Mutation,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from the agent to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A named engine signal.
    Event { event: EngineEvent },

    /// The local cache changed.
    CacheChanged { change: CacheChange },

    /// Response to a mutation: the optimistic entity.
    Mutated {
        entity: Entity,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}
