//! # PeerVault Core
//!
//! Pure primitives for PeerVault: vault records, log identities, and the
//! signed entries that make up each device's append-only log.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Record`] - A single vault item (title, username, secret)
//! - [`RecordId`] - Stable identifier assigned at creation
//! - [`LogIdentity`] - Public identity of one device's log
//! - [`LogEntry`] - A signed `Put` or `Delete` at a position in a log
//! - [`IdentitySeed`] - Secret material shared by all devices of one identity
//! - [`Topic`] - Overlay rendezvous point derived from the seed
//!
//! ## Encoding
//!
//! Record values are UTF-8 JSON with camelCase field names. Log entries are
//! signed over a domain-separated binary encoding, see [`entry::signing_bytes`].

pub mod clock;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod record;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{Blake3Hash, Ed25519Signature, IdentitySeed, Keypair, LogIdentity, Topic};
pub use entry::{materialize, LogEntry, LogOp};
pub use error::CoreError;
pub use record::{Record, RecordChanges, StoredValue, Tombstone};
pub use types::{RecordId, Timestamp};
