//! Error types for the document pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::types::DocumentStatus;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied something unusable (empty upload, unknown stage name)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Document record not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// A stage was asked to run against a record it cannot process
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A status write that is not an edge of the status graph
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    /// Recognition collaborator failed
    #[error("Recognition failed: {0}")]
    Recognition(String),

    /// Read against a consumer group that was never created
    #[error("Consumer group '{group}' does not exist on topic '{topic}'")]
    GroupNotFound { topic: String, group: String },

    /// Stream broker error
    #[error("Broker error: {0}")]
    Broker(String),

    /// Record store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a precondition error
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a recognition error
    pub fn recognition(message: impl Into<String>) -> Self {
        Self::Recognition(message.into())
    }

    /// Infrastructure failures that a retry may clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Broker(_) | Error::Storage(_) | Error::Io(_) | Error::GroupNotFound { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Task join error: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::BAD_REQUEST, "config_error", msg.clone()),
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg.clone()),
            Error::DocumentNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Document not found: {}", id),
            ),
            Error::PreconditionFailed(msg) => {
                (StatusCode::CONFLICT, "precondition_failed", msg.clone())
            }
            Error::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_transition", self.to_string())
            }
            Error::Recognition(msg) => {
                (StatusCode::BAD_GATEWAY, "recognition_error", msg.clone())
            }
            Error::GroupNotFound { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "broker_error", self.to_string())
            }
            Error::Broker(msg) => (StatusCode::SERVICE_UNAVAILABLE, "broker_error", msg.clone()),
            Error::Storage(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg.clone())
            }
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::broker("connection refused").is_transient());
        assert!(Error::storage("database is locked").is_transient());
        assert!(!Error::precondition("status mismatch").is_transient());
        assert!(!Error::recognition("garbled").is_transient());
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = Error::DocumentNotFound(Uuid::new_v4()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
