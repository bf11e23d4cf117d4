//! # PeerVault Store
//!
//! Append-only, owner-signed logs and their persistence.
//!
//! ## Overview
//!
//! Every device writes exactly one log; everything else it holds is a
//! replica of some other device's log. Logs are reached through the
//! [`LogHandle`] trait and opened by a [`LogStore`]. The durable backend is
//! [`SqliteStore`]; [`MemoryStore`] has the same semantics for tests.
//!
//! [`replicate`] streams one log pair over any byte stream.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use peervault_core::IdentitySeed;
//! use peervault_store::{LogStore, SqliteStore};
//!
//! async fn example() -> peervault_store::Result<()> {
//!     let store = SqliteStore::open("vault.db")?;
//!     let log = store.open_local("vault", &IdentitySeed::random()).await?;
//!     log.append("key", b"value").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Signed entries**: replicas verify every entry against the log identity
//! - **Idempotent ingest**: entries already held are skipped
//! - **Per-device identity**: devices sharing a seed still get distinct logs

pub mod error;
pub mod memory;
pub mod migration;
pub mod replicate;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use replicate::{replicate, ReplicationReport, WireMessage};
pub use sqlite::SqliteStore;
pub use traits::{AppendEvent, LogHandle, LogStore, SharedLog};
