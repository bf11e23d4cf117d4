//! The table of known peer logs.
//!
//! The registry is the only owner of peer log handles: it opens them through
//! the log store and closes them when the last session using one ends. Each
//! entry forwards the log's append notifications to the refresh signal, and
//! every add or remove requests a refresh too.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use peervault_core::LogIdentity;
use peervault_store::{LogStore, SharedLog};

use crate::error::Result;
use crate::signal::RefreshSignal;

/// What a registration did.
#[derive(Clone)]
pub enum Registration {
    /// First holder: a new entry was created.
    Added(SharedLog),
    /// The identity was already known; another holder was recorded.
    Existing(SharedLog),
    /// The identity is our own; nothing was registered.
    SelfIdentity,
}

impl Registration {
    /// The registered handle, unless this was our own identity.
    pub fn log(&self) -> Option<&SharedLog> {
        match self {
            Registration::Added(log) | Registration::Existing(log) => Some(log),
            Registration::SelfIdentity => None,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Registration::Added(log) => write!(f, "Added({})", log.identity()),
            Registration::Existing(log) => write!(f, "Existing({})", log.identity()),
            Registration::SelfIdentity => f.write_str("SelfIdentity"),
        }
    }
}

struct PeerEntry {
    identity: LogIdentity,
    log: SharedLog,
    /// Sessions currently using this entry.
    holders: usize,
    forwarder: JoinHandle<()>,
}

/// Known peer logs, in insertion order.
pub struct PeerRegistry {
    local: LogIdentity,
    store: Arc<dyn LogStore>,
    refresh: RefreshSignal,
    entries: Vec<PeerEntry>,
}

impl PeerRegistry {
    pub fn new(local: LogIdentity, store: Arc<dyn LogStore>, refresh: RefreshSignal) -> Self {
        Self {
            local,
            store,
            refresh,
            entries: Vec::new(),
        }
    }

    pub fn local_identity(&self) -> LogIdentity {
        self.local
    }

    /// Register `log` for `identity`.
    ///
    /// No-op for the local identity. For an identity already present the
    /// existing handle is kept and `log` is closed.
    pub async fn register(&mut self, identity: LogIdentity, log: SharedLog) -> Registration {
        if identity == self.local {
            tracing::debug!(identity = %identity, "not registering own log");
            close_quietly(&log).await;
            return Registration::SelfIdentity;
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.identity == identity) {
            entry.holders += 1;
            if !Arc::ptr_eq(&entry.log, &log) {
                close_quietly(&log).await;
            }
            return Registration::Existing(entry.log.clone());
        }

        let forwarder = spawn_forwarder(&log, self.refresh.clone());
        self.entries.push(PeerEntry {
            identity,
            log: log.clone(),
            holders: 1,
            forwarder,
        });
        self.refresh.request();
        tracing::info!(identity = %identity, peers = self.entries.len(), "peer registered");

        Registration::Added(log)
    }

    /// Register `identity`, opening its replica through the store if needed.
    pub async fn open(&mut self, identity: LogIdentity) -> Result<Registration> {
        if identity == self.local {
            return Ok(Registration::SelfIdentity);
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.identity == identity) {
            entry.holders += 1;
            return Ok(Registration::Existing(entry.log.clone()));
        }

        let log = self.store.open_remote(identity).await?;
        Ok(self.register(identity, log).await)
    }

    /// Release one holder of `identity`.
    ///
    /// When the last holder goes, the handle is closed and the entry removed.
    /// Returns whether the entry was removed.
    pub async fn unregister(&mut self, identity: &LogIdentity) -> bool {
        let Some(index) = self.entries.iter().position(|e| &e.identity == identity) else {
            return false;
        };

        let entry = &mut self.entries[index];
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders > 0 {
            return false;
        }

        let entry = self.entries.remove(index);
        entry.forwarder.abort();
        close_quietly(&entry.log).await;
        self.refresh.request();
        tracing::info!(identity = %identity, peers = self.entries.len(), "peer unregistered");
        true
    }

    /// Snapshot of every entry, in insertion order.
    pub fn all(&self) -> Vec<(LogIdentity, SharedLog)> {
        self.entries
            .iter()
            .map(|e| (e.identity, e.log.clone()))
            .collect()
    }

    pub fn identities(&self) -> Vec<LogIdentity> {
        self.entries.iter().map(|e| e.identity).collect()
    }

    pub fn contains(&self, identity: &LogIdentity) -> bool {
        self.entries.iter().any(|e| &e.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close and remove every entry regardless of holders.
    pub async fn close_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        for entry in self.entries.drain(..) {
            entry.forwarder.abort();
            close_quietly(&entry.log).await;
        }
        self.refresh.request();
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        for entry in &self.entries {
            entry.forwarder.abort();
        }
    }
}

fn spawn_forwarder(log: &SharedLog, refresh: RefreshSignal) -> JoinHandle<()> {
    let mut events = log.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => refresh.request(),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn close_quietly(log: &SharedLog) {
    if let Err(e) = log.close().await {
        tracing::warn!(identity = %log.identity(), error = %e, "failed to close log handle");
    }
}
