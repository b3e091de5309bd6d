use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures raised by the backfill collaborators (source, writer, owner
/// directory, checkpoint store). The controller decides which are fatal.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("write conflict on legacy id {0}")]
    WriteConflict(String),

    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("checkpoint store error: {0}")]
    CheckpointPersist(String),

    #[error("owner lookup failed: {0}")]
    OwnerLookup(String),

    #[error("legacy table archival failed: {0}")]
    Archive(String),

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Migration(e) => {
                tracing::error!("Migration error: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "MIGRATION_ERROR",
                    e.to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
