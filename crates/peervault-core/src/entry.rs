//! Signed log entries.
//!
//! A log is an append-only sequence of entries. Each entry is either a `Put`
//! of a value under a key or a `Delete` of a key; neither edits an earlier
//! entry. The current key space of a log is the fold of its entries in order,
//! see [`materialize`].
//!
//! Every entry is signed by the log owner over:
//!
//! ```text
//! "peervault-entry-v0:" || identity(32) || seq(u64 BE) || tag(u8)
//!     || key_len(u32 BE) || key || value_len(u32 BE) || value
//! ```
//!
//! where `tag` is 0 for `Put` and 1 for `Delete` (which has an empty value).

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{Ed25519Signature, Keypair, LogIdentity};
use crate::error::CoreError;

const ENTRY_DOMAIN: &[u8] = b"peervault-entry-v0:";

/// The operation recorded by one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl LogOp {
    pub fn key(&self) -> &str {
        match self {
            LogOp::Put { key, .. } | LogOp::Delete { key } => key,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            LogOp::Put { .. } => 0,
            LogOp::Delete { .. } => 1,
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            LogOp::Put { value, .. } => value,
            LogOp::Delete { .. } => &[],
        }
    }
}

/// An entry at position `seq` (0-based) of a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub op: LogOp,
    #[serde(with = "signature_bytes")]
    pub signature: Ed25519Signature,
}

impl LogEntry {
    /// Create and sign an entry.
    pub fn sign(keypair: &Keypair, seq: u64, op: LogOp) -> Self {
        let message = signing_bytes(&keypair.identity(), seq, &op);
        Self {
            seq,
            signature: keypair.sign(&message),
            op,
        }
    }

    /// Check that the owner of `identity` signed this entry.
    pub fn verify(&self, identity: &LogIdentity) -> Result<(), CoreError> {
        let message = signing_bytes(identity, self.seq, &self.op);
        identity
            .verify(&message, &self.signature)
            .map_err(|_| CoreError::InvalidSignature(self.seq))
    }
}

/// The exact bytes an entry signature covers.
pub fn signing_bytes(identity: &LogIdentity, seq: u64, op: &LogOp) -> Vec<u8> {
    let key = op.key().as_bytes();
    let value = op.value();

    let mut buf = Vec::with_capacity(ENTRY_DOMAIN.len() + 32 + 8 + 1 + 8 + key.len() + value.len());
    buf.extend_from_slice(ENTRY_DOMAIN);
    buf.extend_from_slice(identity.as_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.push(op.tag());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Fold entries (in seq order) into the current key space, ordered by key.
pub fn materialize<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> BTreeMap<String, Bytes> {
    let mut keys = BTreeMap::new();
    for entry in entries {
        match &entry.op {
            LogOp::Put { key, value } => {
                keys.insert(key.clone(), value.clone());
            }
            LogOp::Delete { key } => {
                keys.remove(key);
            }
        }
    }
    keys
}

mod signature_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(sig: &Ed25519Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(sig.as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ed25519Signature, D::Error> {
        let bytes = Bytes::deserialize(d)?;
        Ed25519Signature::try_from(bytes.as_ref()).map_err(serde::de::Error::custom)
    }
}
