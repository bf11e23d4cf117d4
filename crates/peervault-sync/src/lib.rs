//! # PeerVault Sync
//!
//! Everything between "a device joined the overlay" and "the merged view
//! changed".
//!
//! ## Overview
//!
//! - [`Overlay`] finds peers on the identity's topic and yields connections
//! - [`KeyExchange`] learns a peer's log identity when the overlay does not
//!   surface it
//! - [`PeerRegistry`] owns one replica handle per known peer log
//! - [`SessionManager`] runs replication on each connection and releases the
//!   peer when it ends
//! - [`merge`] folds the local log and every registered replica into a
//!   last-write-wins [`MergedView`]
//! - [`RefreshSignal`] carries "something changed" from appends to the
//!   controller, coalescing bursts
//!
//! ## Design Notes
//!
//! - **Rebuild, never patch**: each merge starts from an empty map
//! - **Tolerant input**: malformed handshake lines and record values are
//!   dropped and reported, never fatal
//! - **Contained failures**: a failing session unregisters its peer and ends;
//!   other sessions are unaffected

pub mod error;
pub mod handshake;
pub mod merge;
pub mod overlay;
pub mod registry;
pub mod session;
pub mod signal;

pub use error::{Result, SyncError};
pub use handshake::{exchange, ExchangeState, HandshakeFrame, HandshakeOutcome, KeyExchange};
pub use merge::{merge, MergeIssue, MergeOutcome, MergedView};
pub use overlay::{AsyncStream, Connection, JoinOptions, Overlay};
pub use registry::{PeerRegistry, Registration};
pub use session::{SessionManager, SessionOutcome, SyncConfig};
pub use signal::RefreshSignal;
