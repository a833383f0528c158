//! Unified error handling for the local API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::backend::BackendError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Engine error: {0}")]
    Engine(#[from] shopsync_engine::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn parts(&self) -> (StatusCode, String, Option<String>) {
        use shopsync_engine::Error as EngineError;

        match self {
            AppError::Engine(e) => match e {
                EngineError::EntityNotFound { .. } | EngineError::OperationNotFound(_) => {
                    (StatusCode::NOT_FOUND, e.to_string(), None)
                }
                EngineError::Storage(msg) | EngineError::InvalidSnapshot(msg) => {
                    tracing::error!(error = %e, "engine storage failure");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Local storage failure".to_string(),
                        Some(msg.clone()),
                    )
                }
                EngineError::EntityAlreadyExists { .. } => {
                    (StatusCode::CONFLICT, e.to_string(), None)
                }
                _ => {
                    tracing::warn!(error = %e, "engine rejected request");
                    (StatusCode::BAD_REQUEST, e.to_string(), None)
                }
            },
            AppError::Backend(e) => {
                tracing::warn!(error = %e, "backend call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "Remote backend error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(msg.clone()),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = self.parts();
        (status, Json(ErrorResponse { error, details })).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
