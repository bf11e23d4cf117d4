//! # PeerVault Testkit
//!
//! Testing utilities for PeerVault.
//!
//! ## Overview
//!
//! - **Fixtures**: several devices of one identity on an in-memory overlay,
//!   each with a manual clock
//! - **Generators**: proptest strategies for records, tombstones and
//!   per-device write histories
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use peervault_testkit::fixtures::{wait_for, TestNetwork};
//!
//! async fn example() -> peervault::Result<()> {
//!     let net = TestNetwork::new();
//!     let a = net.device().await?;
//!     let b = net.device().await?;
//!
//!     let id = a.vault.create("bank", "alice", "p1").await?;
//!     assert!(wait_for(&b.vault, |view| view.contains(&id)).await.is_some());
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{test_config, wait_for, wait_for_peers, TestDevice, TestNetwork};
