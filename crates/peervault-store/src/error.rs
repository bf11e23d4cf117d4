//! Error types for the store module.

use peervault_core::{CoreError, LogIdentity};
use thiserror::Error;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Entry (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The handle has been closed.
    #[error("log {0} is closed")]
    Closed(LogIdentity),

    /// Append or delete on a log this device does not own.
    #[error("log {0} is not writable")]
    NotWritable(LogIdentity),

    /// An entry offered for ingest does not fit the log.
    #[error("invalid entry at seq {seq}: {reason}")]
    InvalidEntry { seq: u64, reason: String },

    /// Entry or identity failed a core check (e.g. signature).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Replication wire violation.
    #[error("replication protocol error: {0}")]
    Protocol(String),

    /// Blocking task failed to complete.
    #[error("background task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
