//! Vault records and the values stored for them in a log.
//!
//! A record is only ever replaced whole: an update writes a complete new
//! record under the same key with a refreshed `updated_at`.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{RecordId, Timestamp};

/// A single vault item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub username: String,
    #[serde(alias = "password")]
    pub secret: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Record {
    /// Create a record with `created_at = updated_at = now`.
    pub fn new(
        id: RecordId,
        title: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            username: username.into(),
            secret: secret.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the replacement record for an update at `now`.
    pub fn with_changes(&self, changes: &RecordChanges, now: Timestamp) -> Self {
        let mut next = self.clone();
        if let Some(title) = &changes.title {
            next.title = title.clone();
        }
        if let Some(username) = &changes.username {
            next.username = username.clone();
        }
        if let Some(secret) = &changes.secret {
            next.secret = secret.clone();
        }
        next.updated_at = now;
        next
    }

    /// Case-insensitive match on title or username.
    ///
    /// `term` is expected to be trimmed and lowercased already.
    pub fn matches(&self, term: &str) -> bool {
        self.title.to_lowercase().contains(term) || self.username.to_lowercase().contains(term)
    }
}

/// Field overrides for an update. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordChanges {
    pub title: Option<String>,
    pub username: Option<String>,
    pub secret: Option<String>,
}

impl RecordChanges {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Marks a record as deleted as of `deleted_at`.
///
/// Stored under the record's key so it supersedes older versions in every
/// log that replicates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Tombstone {
    pub id: RecordId,
    pub deleted_at: Timestamp,
}

/// A value as stored under a record key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Record(Record),
    Tombstone(Tombstone),
}

impl StoredValue {
    /// Parse a stored value from its JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedValue(e.to_string()))
    }

    /// Encode to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::EncodingError(e.to_string()))
    }

    pub fn id(&self) -> RecordId {
        match self {
            StoredValue::Record(record) => record.id,
            StoredValue::Tombstone(tombstone) => tombstone.id,
        }
    }

    /// The instant this value was written, used for last-write-wins.
    pub fn written_at(&self) -> Timestamp {
        match self {
            StoredValue::Record(record) => record.updated_at,
            StoredValue::Tombstone(tombstone) => tombstone.deleted_at,
        }
    }
}
