//! # PeerVault
//!
//! A local-first vault of records replicated between the devices of one
//! identity.
//!
//! ## Overview
//!
//! Each device writes one signed, append-only log. Devices holding the same
//! identity seed meet on an overlay topic derived from it, replicate each
//! other's logs, and fold every log into one view:
//!
//! - **Records**: title, username and secret, replaced whole on update
//! - **Logs**: one writer each; peers only ever hold replicas
//! - **Merge**: newest `updated_at` wins per record id
//! - **Tombstones**: deletes are written as values so they replicate
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use peervault::core::IdentitySeed;
//! use peervault::store::SqliteStore;
//! use peervault::sync::overlay::memory::MemoryNetwork;
//! use peervault::{Vault, VaultConfig};
//!
//! async fn example() -> peervault::Result<()> {
//!     let store = Arc::new(SqliteStore::open("vault.db")?);
//!     let overlay = Arc::new(MemoryNetwork::new().swarm());
//!
//!     let vault = Vault::new(store, overlay, VaultConfig::default());
//!     vault.start(&IdentitySeed::random()).await?;
//!
//!     let id = vault.create("bank", "alice", "hunter2").await?;
//!     assert!(vault.get(&id).await?.is_some());
//!
//!     vault.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `peervault::core` - records, identities, clocks
//! - `peervault::store` - log storage and replication
//! - `peervault::sync` - overlay, key exchange, registry and merge

pub mod config;
pub mod error;
pub mod vault;

pub use peervault_core as core;
pub use peervault_store as store;
pub use peervault_sync as sync;

pub use config::{DeletePolicy, VaultConfig, DEFAULT_LOG_NAME};
pub use error::{Result, VaultError};
pub use vault::{Vault, VaultState};

pub use peervault_core::{IdentitySeed, LogIdentity, Record, RecordChanges, RecordId, Timestamp};
pub use peervault_sync::{MergedView, SyncConfig};
