//! Error types for the vault.

use peervault_core::{CoreError, RecordId};
use peervault_store::StoreError;
use thiserror::Error;

use crate::vault::VaultState;

/// Errors surfaced by [`Vault`](crate::Vault) calls.
///
/// Failures inside replication never reach here; they end the affected
/// session and are logged.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The local log or the overlay failed to start. Not retried.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Update or delete of an id absent from the merged view.
    #[error("record not found: {0}")]
    NotFound(RecordId),

    /// The vault is not active.
    #[error("vault unavailable while {0:?}")]
    StoreUnavailable(VaultState),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Record encoding error.
    #[error("record error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
