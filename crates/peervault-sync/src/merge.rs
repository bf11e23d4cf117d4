//! Last-write-wins merge of every known log into one view.
//!
//! Every pass starts from an empty map. Logs are scanned in traversal order
//! (local log first, then peers in registry insertion order) and each stored
//! value competes with the current candidate for its record id:
//!
//! - a strictly greater write instant replaces the candidate
//! - an equal or smaller one is discarded, so ties keep the first-seen value
//!
//! Tombstones compete like records. Ids whose winner is a tombstone are left
//! out of the view. Values that fail to parse, and values whose embedded id
//! disagrees with their key, are skipped and reported as [`MergeIssue`]s. A
//! log that cannot be scanned counts as empty for the pass.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use peervault_core::{Blake3Hash, LogIdentity, Record, RecordId, StoredValue};
use peervault_store::SharedLog;

/// A data problem found during a merge pass. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeIssue {
    /// A value is not a record or tombstone.
    Parse {
        log: LogIdentity,
        key: String,
        reason: String,
    },
    /// A log could not be scanned.
    Unreadable { log: LogIdentity, reason: String },
    /// A value is stored under a key other than its own id.
    KeyMismatch {
        log: LogIdentity,
        key: String,
        id: RecordId,
    },
}

/// The merged, queryable set of live records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedView {
    records: BTreeMap<RecordId, Record>,
}

impl MergedView {
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }

    /// Records whose title or username contains `term`, ignoring case and
    /// surrounding whitespace. An empty term matches everything.
    pub fn search(&self, term: &str) -> Vec<&Record> {
        let term = term.trim().to_lowercase();
        self.records
            .values()
            .filter(|r| term.is_empty() || r.matches(&term))
            .collect()
    }

    /// Deterministic hash of the full view contents.
    ///
    /// Two views hash equal iff they hold the same records with the same
    /// field values.
    pub fn digest(&self) -> Blake3Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"peervault-view-v0:");
        hasher.update(&(self.records.len() as u64).to_be_bytes());

        for record in self.records.values() {
            hasher.update(record.id.as_uuid().as_bytes());
            for field in [&record.title, &record.username, &record.secret] {
                hasher.update(&(field.len() as u64).to_be_bytes());
                hasher.update(field.as_bytes());
            }
            hasher.update(&record.created_at.as_millis().to_be_bytes());
            hasher.update(&record.updated_at.as_millis().to_be_bytes());
        }

        Blake3Hash(*hasher.finalize().as_bytes())
    }
}

impl FromIterator<Record> for MergedView {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().map(|r| (r.id, r)).collect(),
        }
    }
}

/// Result of one merge pass.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub view: MergedView,
    pub issues: Vec<MergeIssue>,
    /// Ids left out because their newest value is a tombstone.
    pub tombstoned: usize,
}

/// Merge `local` and `peers` into a fresh view.
pub async fn merge(local: &SharedLog, peers: &[(LogIdentity, SharedLog)]) -> MergeOutcome {
    let logs = std::iter::once((local.identity(), local)).chain(peers.iter().map(|(id, log)| (*id, log)));

    let mut winners: BTreeMap<RecordId, StoredValue> = BTreeMap::new();
    let mut issues = Vec::new();

    for (identity, log) in logs {
        let entries = match log.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(log = %identity, error = %e, "log unreadable, merging it as empty");
                issues.push(MergeIssue::Unreadable {
                    log: identity,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        for (key, value) in entries {
            let stored = match StoredValue::parse(&value) {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(log = %identity, key = %key, error = %e, "skipping unparseable entry");
                    issues.push(MergeIssue::Parse {
                        log: identity,
                        key,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let id = stored.id();
            if RecordId::parse(&key).ok() != Some(id) {
                tracing::warn!(log = %identity, key = %key, id = %id, "skipping entry stored under a foreign key");
                issues.push(MergeIssue::KeyMismatch {
                    log: identity,
                    key,
                    id,
                });
                continue;
            }

            match winners.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(stored);
                }
                Entry::Occupied(mut slot) => {
                    if stored.written_at() > slot.get().written_at() {
                        slot.insert(stored);
                    }
                }
            }
        }
    }

    let mut tombstoned = 0;
    let view = winners
        .into_values()
        .filter_map(|stored| match stored {
            StoredValue::Record(record) => Some(record),
            StoredValue::Tombstone(_) => {
                tombstoned += 1;
                None
            }
        })
        .collect();

    MergeOutcome {
        view,
        issues,
        tombstoned,
    }
}
