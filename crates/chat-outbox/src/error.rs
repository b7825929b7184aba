//! Outbox error types.

use crate::types::OutboxId;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No record with the given outbox ID
    #[error("Outbox record not found: {0}")]
    NotFound(OutboxId),

    /// A caller-supplied outbox ID is already queued
    #[error("Outbox ID already queued: {0}")]
    DuplicateOutboxId(OutboxId),

    /// Stored data was written by an incompatible version
    #[error("Unsupported outbox version: {0}")]
    UnsupportedVersion(i64),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
