//! Error types for PeerVault Core.

use thiserror::Error;

/// Errors that can occur while handling records, identities and log entries.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature at seq {0}")]
    InvalidSignature(u64),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid identity encoding: {0}")]
    InvalidIdentity(String),

    #[error("invalid record id: {0}")]
    InvalidRecordId(String),

    #[error("malformed record value: {0}")]
    MalformedValue(String),

    #[error("encoding error: {0}")]
    EncodingError(String),
}
