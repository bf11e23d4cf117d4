//! The log handle contract.
//!
//! A [`LogHandle`] wraps one append-only, owner-signed log. The owning device
//! holds a writable handle; every other device holds read-mostly replicas
//! that only grow through [`LogHandle::ingest`]. A [`LogStore`] opens handles
//! and persists them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use peervault_core::{IdentitySeed, LogEntry, LogIdentity};

use crate::error::Result;

/// Notification that a log grew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEvent {
    /// The log that grew.
    pub log: LogIdentity,
    /// Its length after the append.
    pub length: u64,
}

/// Shared reference to a log handle.
pub type SharedLog = Arc<dyn LogHandle>;

/// One append-only authenticated log.
///
/// # Design Notes
///
/// - **Owner-only writes**: `append` and `delete` fail with `NotWritable` on
///   replicas.
/// - **Snapshot scans**: `scan` reflects every entry committed before it
///   started and none after, so it is safe to call concurrently with appends.
/// - **Verified ingest**: replicas accept only contiguous entries carrying a
///   valid signature from the log identity. Already-held entries are skipped.
/// - **Scoped lifecycle**: after `close` every operation fails with `Closed`;
///   other handles on the same log are unaffected.
#[async_trait]
pub trait LogHandle: Send + Sync {
    /// Stable public identity of the log.
    fn identity(&self) -> LogIdentity;

    /// Whether this handle can append (it owns the signing key).
    fn is_writable(&self) -> bool;

    /// Put `value` under `key`. Returns the seq of the new entry.
    async fn append(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Remove `key` from the key space. Returns the seq of the new entry.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Current key space ordered by key.
    async fn scan(&self) -> Result<Vec<(String, Bytes)>>;

    /// Number of entries in the log.
    async fn len(&self) -> Result<u64>;

    /// Entries with `seq >= from`, in order.
    async fn entries_since(&self, from: u64) -> Result<Vec<LogEntry>>;

    /// Add replicated entries. Returns how many were new.
    async fn ingest(&self, entries: Vec<LogEntry>) -> Result<usize>;

    /// Subscribe to append notifications.
    fn subscribe(&self) -> broadcast::Receiver<AppendEvent>;

    /// Release this handle.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens and persists log handles.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open this device's writable log named `name`, creating it if absent.
    ///
    /// The same store returns the same identity for the same name and seed.
    async fn open_local(&self, name: &str, seed: &IdentitySeed) -> Result<SharedLog>;

    /// Open a replica of someone else's log, creating an empty one if absent.
    async fn open_remote(&self, identity: LogIdentity) -> Result<SharedLog>;
}

/// Check a batch offered for ingest against the current length.
///
/// Returns the entries that are new, in order. Entries below `length` are
/// dropped as duplicates; a gap or a bad signature rejects the whole batch.
pub(crate) fn admit_entries(
    identity: &LogIdentity,
    length: u64,
    entries: Vec<LogEntry>,
) -> Result<Vec<LogEntry>> {
    let mut expected = length;
    let mut fresh = Vec::new();

    for entry in entries {
        if entry.seq < expected {
            continue;
        }
        if entry.seq != expected {
            return Err(crate::error::StoreError::InvalidEntry {
                seq: entry.seq,
                reason: format!("expected seq {expected}"),
            });
        }
        entry.verify(identity)?;
        expected += 1;
        fresh.push(entry);
    }

    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use peervault_core::{Keypair, LogOp};

    fn entry(keypair: &Keypair, seq: u64) -> LogEntry {
        LogEntry::sign(
            keypair,
            seq,
            LogOp::Put {
                key: format!("k{seq}"),
                value: Bytes::from_static(b"v"),
            },
        )
    }

    #[test]
    fn test_admit_skips_duplicates() {
        let keypair = Keypair::generate();
        let batch = (0..4).map(|s| entry(&keypair, s)).collect();
        let fresh = admit_entries(&keypair.identity(), 2, batch).unwrap();
        assert_eq!(fresh.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_admit_rejects_gap() {
        let keypair = Keypair::generate();
        let batch = vec![entry(&keypair, 0), entry(&keypair, 2)];
        let err = admit_entries(&keypair.identity(), 0, batch).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry { seq: 2, .. }));
    }

    #[test]
    fn test_admit_rejects_forgery() {
        let owner = Keypair::generate();
        let forger = Keypair::generate();
        let batch = vec![entry(&forger, 0)];
        assert!(admit_entries(&owner.identity(), 0, batch).is_err());
    }
}
