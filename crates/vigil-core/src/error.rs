//! Core error types for vigil-core.
//!
//! This module defines the error hierarchy using thiserror. The
//! taxonomy matters for recovery behavior: storage write failures are
//! hard failures surfaced to the ingestion caller, while upstream
//! timeouts and sink failures are recovered from locally.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for vigil-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Storage-related errors (append/read). Never silently swallowed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Ingested snapshot was rejected before any mutation.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Upstream service errors (hint fetch). Degrades, never fatal.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Notification delivery errors. Rule stays armed for retry.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Snapshot validation errors.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Task id missing or empty -- the whole snapshot is rejected.
    #[error("Snapshot has no task id")]
    MissingTaskId,
}

/// Upstream service errors.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The hint fetch did not complete within its bounded timeout.
    #[error("Upstream request timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Upstream returned a non-success response.
    #[error("Upstream request failed: {0}")]
    RequestFailed(String),
}

/// Notification sink errors.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Delivery failed; the alert rule stays armed for retry.
    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),

    /// The destination is not usable (bad URL, empty address).
    #[error("Invalid notification destination '{destination}': {message}")]
    InvalidDestination { destination: String, message: String },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    StorageError::Locked
                } else {
                    StorageError::QueryFailed(err.to_string())
                }
            }
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::DeliveryFailed(err.to_string())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
