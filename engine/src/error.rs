//! Error types for the Shopsync engine.

use crate::{EntityId, OperationId};
use thiserror::Error;

/// All possible errors from the Shopsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("entity not found: {entity_type}/{id}")]
    EntityNotFound { entity_type: String, id: EntityId },

    #[error("entity already exists: {entity_type}/{id}")]
    EntityAlreadyExists { entity_type: String, id: EntityId },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Queue errors
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // State errors
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether this error means the payload itself is unacceptable, as
    /// opposed to a missing record or a storage problem.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
