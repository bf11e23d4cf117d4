//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur while discovering peers or replicating with them.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The overlay could not join, accept or leave.
    #[error("overlay error: {0}")]
    Overlay(String),

    /// The key exchange did not yield a usable peer identity.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] peervault_store::StoreError),

    /// Connection I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Replication with a peer stopped with an error.
    #[error("replication with {peer} failed: {reason}")]
    Replication { peer: String, reason: String },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
