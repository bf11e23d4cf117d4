//! Replication sessions, one per peer connection.
//!
//! A session resolves the peer's log identity (from the overlay when it
//! knows it, otherwise through the key exchange), takes a hold on the peer's
//! replica in the registry, and runs the store's replication until the
//! connection ends. The hold is always released afterwards. Sessions never
//! return errors: every ending is a [`SessionOutcome`] and is logged.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::sync::{watch, Mutex};

use peervault_core::LogIdentity;
use peervault_store::{replicate, ReplicationReport, SharedLog};

use crate::error::{Result, SyncError};
use crate::handshake::{exchange, HandshakeOutcome, KeyExchange};
use crate::overlay::{AsyncStream, Connection};
use crate::registry::{PeerRegistry, Registration};

/// Timing knobs for sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a connection may take to announce its identity.
    pub handshake_timeout: Duration,
    /// Quiet period after a refresh request before merging, so bursts of
    /// appends share one pass. Zero merges immediately.
    pub refresh_debounce: Duration,
    /// How long shutdown waits for sessions before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            refresh_debounce: Duration::from_millis(25),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_refresh_debounce(mut self, debounce: Duration) -> Self {
        self.refresh_debounce = debounce;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The peer is this device's own log; nothing was wired.
    SelfConnection,
    /// No peer identity could be learned.
    HandshakeFailed(String),
    /// Shutdown arrived before replication started.
    Cancelled,
    /// Replication ran and the connection ended cleanly.
    Closed {
        peer: LogIdentity,
        report: ReplicationReport,
    },
    /// Replication stopped with an error.
    Failed { peer: LogIdentity, error: String },
}

/// Binds peer connections to replication.
pub struct SessionManager {
    registry: Arc<Mutex<PeerRegistry>>,
    local: SharedLog,
    log_name: String,
    config: SyncConfig,
}

impl SessionManager {
    pub fn new(
        registry: Arc<Mutex<PeerRegistry>>,
        local: SharedLog,
        log_name: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            local,
            log_name: log_name.into(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Mutex<PeerRegistry>> {
        &self.registry
    }

    /// Run one connection to completion.
    pub async fn bind(&self, connection: Connection, shutdown: watch::Receiver<bool>) -> SessionOutcome {
        let outcome = self.run(connection, shutdown).await;
        match &outcome {
            SessionOutcome::SelfConnection => {
                tracing::debug!("ignoring connection to own log");
            }
            SessionOutcome::HandshakeFailed(reason) => {
                tracing::debug!(reason = %reason, "dropping connection without handshake");
            }
            SessionOutcome::Cancelled => {}
            SessionOutcome::Closed { peer, report } => {
                tracing::info!(
                    peer = %peer,
                    sent = report.sent,
                    received = report.received,
                    "replication session closed"
                );
            }
            SessionOutcome::Failed { peer, error } => {
                tracing::warn!(peer = %peer, error = %error, "replication session failed");
            }
        }
        outcome
    }

    async fn run(&self, connection: Connection, shutdown: watch::Receiver<bool>) -> SessionOutcome {
        let initiator = connection.initiator;
        let remote_log = connection.remote_log;
        let mut stream = BufReader::new(connection.stream);

        let peer = match self.resolve_peer(remote_log, &mut stream, &shutdown).await {
            Ok(Some(peer)) => peer,
            Ok(None) => return SessionOutcome::SelfConnection,
            Err(SyncError::Cancelled) => return SessionOutcome::Cancelled,
            Err(e) => return SessionOutcome::HandshakeFailed(e.to_string()),
        };

        let registration = self.registry.lock().await.open(peer).await;
        let remote = match registration {
            Ok(Registration::Added(log)) | Ok(Registration::Existing(log)) => log,
            Ok(Registration::SelfIdentity) => return SessionOutcome::SelfConnection,
            Err(e) => {
                return SessionOutcome::Failed {
                    peer,
                    error: e.to_string(),
                }
            }
        };

        tracing::debug!(peer = %peer, initiator, "replicating");
        let result = replicate(stream, self.local.clone(), remote, stopped(shutdown))
            .await
            .map_err(|e| SyncError::Replication {
                peer: peer.to_string(),
                reason: e.to_string(),
            });

        self.registry.lock().await.unregister(&peer).await;

        match result {
            Ok(report) => SessionOutcome::Closed { peer, report },
            Err(e) => SessionOutcome::Failed {
                peer,
                error: e.to_string(),
            },
        }
    }

    /// Learn the peer's log identity. `None` when it is this device's own.
    async fn resolve_peer(
        &self,
        hint: Option<LogIdentity>,
        stream: &mut BufReader<Box<dyn AsyncStream>>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<LogIdentity>> {
        let local_identity = self.local.identity();

        let peer = match hint {
            Some(identity) => identity,
            None => {
                let mut kx = KeyExchange::new(local_identity, self.log_name.clone());
                let handshake =
                    tokio::time::timeout(self.config.handshake_timeout, exchange(stream, &mut kx));

                let outcome = tokio::select! {
                    result = handshake => result
                        .map_err(|_| SyncError::Timeout("handshake timed out".into()))??,
                    _ = stopped(shutdown.clone()) => return Err(SyncError::Cancelled),
                };

                match outcome {
                    HandshakeOutcome::SelfConnection => return Ok(None),
                    HandshakeOutcome::Closed => {
                        return Err(SyncError::Handshake(
                            "connection closed before handshake".into(),
                        ))
                    }
                    HandshakeOutcome::Peer(_) => kx.begin_replication().ok_or_else(|| {
                        SyncError::Handshake("no peer identity learned".into())
                    })?,
                }
            }
        };

        Ok((peer != local_identity).then_some(peer))
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
