//! The vault controller.
//!
//! Owns the local log, the overlay session and the peer registry, and
//! publishes the merged view. Lifecycle:
//!
//! ```text
//! Uninitialized --start--> Joining --> Active --shutdown--> TearingDown --> Closed
//!       ^                     |
//!       +----- init error ----+
//! ```
//!
//! While active, three kinds of task run: one accept loop spawning a session
//! per connection, one refresh loop rebuilding the view when asked, and one
//! append forwarder per registered peer (owned by the registry).

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use peervault_core::{
    Clock, IdentitySeed, LogIdentity, Record, RecordChanges, RecordId, StoredValue, SystemClock,
    Timestamp, Tombstone, Topic,
};
use peervault_store::{LogStore, SharedLog};
use peervault_sync::{
    merge, Connection, JoinOptions, MergedView, Overlay, PeerRegistry, RefreshSignal,
    SessionManager, SyncConfig,
};

use crate::config::{DeletePolicy, VaultConfig};
use crate::error::{Result, VaultError};

/// Lifecycle state of a [`Vault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Uninitialized,
    Joining,
    Active,
    TearingDown,
    Closed,
}

/// A local-first, peer-replicated record vault.
///
/// Writes only ever go to this device's log. Reads come from the merged
/// view, rebuilt from every known log whenever one of them changes.
pub struct Vault {
    store: Arc<dyn LogStore>,
    overlay: Arc<dyn Overlay>,
    config: VaultConfig,
    clock: Arc<dyn Clock>,
    state: watch::Sender<VaultState>,
    views: Arc<watch::Sender<Arc<MergedView>>>,
    active: RwLock<Option<Arc<Active>>>,
}

/// Everything that only exists while the vault is active.
struct Active {
    topic: Topic,
    local: SharedLog,
    registry: Arc<Mutex<PeerRegistry>>,
    rebuilder: Rebuilder,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Vault {
    /// Create a vault over `store` and `overlay`. Nothing is opened until
    /// [`start`](Self::start).
    pub fn new(store: Arc<dyn LogStore>, overlay: Arc<dyn Overlay>, config: VaultConfig) -> Self {
        let (state, _) = watch::channel(VaultState::Uninitialized);
        let (views, _) = watch::channel(Arc::new(MergedView::default()));
        Self {
            store,
            overlay,
            config,
            clock: Arc::new(SystemClock),
            state,
            views: Arc::new(views),
            active: RwLock::new(None),
        }
    }

    /// Use `clock` for record timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn state(&self) -> VaultState {
        *self.state.borrow()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Open the local log, join the overlay and start serving peers.
    ///
    /// On failure the vault returns to `Uninitialized` and may be started
    /// again.
    pub async fn start(&self, seed: &IdentitySeed) -> Result<()> {
        let mut slot = self.active.write().await;
        let state = self.state();
        if state != VaultState::Uninitialized {
            return Err(VaultError::Initialization(format!(
                "cannot start a vault that is {state:?}"
            )));
        }

        self.state.send_replace(VaultState::Joining);
        match self.join(seed).await {
            Ok(active) => {
                tracing::info!(
                    identity = %active.local.identity(),
                    topic = %active.topic.to_hex(),
                    "vault active"
                );
                active.rebuilder.rebuild().await;
                *slot = Some(active);
                self.state.send_replace(VaultState::Active);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "vault failed to start");
                self.state.send_replace(VaultState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn join(&self, seed: &IdentitySeed) -> Result<Arc<Active>> {
        let local = self
            .store
            .open_local(&self.config.log_name, seed)
            .await
            .map_err(|e| VaultError::Initialization(format!("opening local log: {e}")))?;
        let identity = local.identity();
        let topic = Topic::derive(seed);

        let connections = match self
            .overlay
            .join(topic, JoinOptions::default().announce(identity))
            .await
        {
            Ok(connections) => connections,
            Err(e) => {
                let _ = local.close().await;
                return Err(VaultError::Initialization(format!("joining overlay: {e}")));
            }
        };

        let refresh = RefreshSignal::new();
        let registry = Arc::new(Mutex::new(PeerRegistry::new(
            identity,
            self.store.clone(),
            refresh.clone(),
        )));
        let rebuilder = Rebuilder {
            local: local.clone(),
            registry: registry.clone(),
            lock: Arc::new(Mutex::new(())),
            views: self.views.clone(),
        };
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            local.clone(),
            self.config.log_name.clone(),
            self.config.sync.clone(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(accept_loop(
                connections,
                sessions,
                shutdown_rx.clone(),
                self.config.sync.clone(),
            )),
            tokio::spawn(refresh_loop(
                refresh,
                rebuilder.clone(),
                shutdown_rx,
                self.config.sync.clone(),
            )),
        ];

        Ok(Arc::new(Active {
            topic,
            local,
            registry,
            rebuilder,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Stop serving peers, close every log and leave the overlay.
    ///
    /// Sessions get `shutdown_timeout` to finish before they are aborted.
    /// Calling this on a vault that never started just marks it closed.
    pub async fn shutdown(&self) -> Result<()> {
        let mut slot = self.active.write().await;
        let Some(active) = slot.take() else {
            if self.state() == VaultState::Uninitialized {
                self.state.send_replace(VaultState::Closed);
            }
            return Ok(());
        };

        self.state.send_replace(VaultState::TearingDown);
        let _ = active.shutdown.send(true);

        // The accept loop bounds its own session drain; this bound is a
        // backstop for both tasks.
        let grace = self.config.sync.shutdown_timeout * 2;
        for mut task in active.tasks.lock().await.drain(..) {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("vault task did not stop in time, aborting");
                task.abort();
            }
        }

        active.registry.lock().await.close_all().await;
        if let Err(e) = active.local.close().await {
            tracing::warn!(error = %e, "failed to close local log");
        }
        if let Err(e) = self.overlay.destroy().await {
            tracing::warn!(error = %e, "failed to leave overlay");
        }

        self.state.send_replace(VaultState::Closed);
        tracing::info!(identity = %active.local.identity(), "vault closed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Records
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a record in the local log. Returns its fresh id.
    pub async fn create(
        &self,
        title: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<RecordId> {
        let active = self.active().await?;
        let record = Record::new(RecordId::generate(), title, username, secret, self.clock.now());

        write(&active.local, StoredValue::Record(record.clone())).await?;
        active.rebuilder.rebuild().await;
        tracing::debug!(id = %record.id, "record created");
        Ok(record.id)
    }

    /// Replace the visible record `id` with `changes` applied.
    ///
    /// The new version goes to the local log even when the current one came
    /// from a peer. Concurrent updates elsewhere are settled by the merge.
    pub async fn update(&self, id: RecordId, changes: RecordChanges) -> Result<Record> {
        let active = self.active().await?;
        let current = self
            .views
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(VaultError::NotFound(id))?;

        let next = current.with_changes(&changes, self.stamp(current.updated_at));
        write(&active.local, StoredValue::Record(next.clone())).await?;
        active.rebuilder.rebuild().await;
        tracing::debug!(id = %id, "record updated");
        Ok(next)
    }

    /// Delete the visible record `id`, according to the delete policy.
    pub async fn delete(&self, id: RecordId) -> Result<()> {
        let active = self.active().await?;
        let current = self
            .views
            .borrow()
            .get(&id)
            .map(|record| record.updated_at)
            .ok_or(VaultError::NotFound(id))?;

        match self.config.delete_policy {
            DeletePolicy::Tombstone => {
                let tombstone = Tombstone {
                    id,
                    deleted_at: self.stamp(current),
                };
                write(&active.local, StoredValue::Tombstone(tombstone)).await?;
            }
            DeletePolicy::Lossy => {
                active.local.delete(&id.to_key()).await?;
            }
        }

        active.rebuilder.rebuild().await;
        tracing::debug!(id = %id, policy = ?self.config.delete_policy, "record deleted");
        Ok(())
    }

    /// The current merged view.
    pub async fn view(&self) -> Result<Arc<MergedView>> {
        self.active().await?;
        Ok(self.views.borrow().clone())
    }

    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        Ok(self.view().await?.get(id).cloned())
    }

    /// Records whose title or username contains `term`, ignoring case.
    pub async fn search(&self, term: &str) -> Result<Vec<Record>> {
        Ok(self
            .view()
            .await?
            .search(term)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Force a merge pass and return its view.
    pub async fn refresh(&self) -> Result<Arc<MergedView>> {
        let active = self.active().await?;
        Ok(active.rebuilder.rebuild().await)
    }

    /// Follow the merged view. Every rebuild publishes a new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MergedView>> {
        self.views.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identity & peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Identity of this device's log.
    pub async fn identity(&self) -> Result<LogIdentity> {
        Ok(self.active().await?.local.identity())
    }

    /// Overlay topic shared by every device of this identity.
    pub async fn topic(&self) -> Result<Topic> {
        Ok(self.active().await?.topic)
    }

    /// Identities of registered peer logs, in registration order.
    pub async fn peers(&self) -> Result<Vec<LogIdentity>> {
        let active = self.active().await?;
        let peers = active.registry.lock().await.identities();
        Ok(peers)
    }

    /// The clock's time, or just past `after` when the clock is behind it.
    fn stamp(&self, after: Timestamp) -> Timestamp {
        let now = self.clock.now();
        if now > after {
            now
        } else {
            Timestamp::from_millis(after.as_millis() + 1)
        }
    }

    async fn active(&self) -> Result<Arc<Active>> {
        let state = self.state();
        if state != VaultState::Active {
            return Err(VaultError::StoreUnavailable(state));
        }
        self.active
            .read()
            .await
            .clone()
            .ok_or_else(|| VaultError::StoreUnavailable(self.state()))
    }
}

/// Serialized merge passes publishing into the view channel.
#[derive(Clone)]
struct Rebuilder {
    local: SharedLog,
    registry: Arc<Mutex<PeerRegistry>>,
    /// One pass at a time, so published views never go backwards.
    lock: Arc<Mutex<()>>,
    views: Arc<watch::Sender<Arc<MergedView>>>,
}

impl Rebuilder {
    async fn rebuild(&self) -> Arc<MergedView> {
        let _pass = self.lock.lock().await;
        let peers = self.registry.lock().await.all();
        let outcome = merge(&self.local, &peers).await;

        tracing::debug!(
            records = outcome.view.len(),
            peers = peers.len(),
            issues = outcome.issues.len(),
            tombstoned = outcome.tombstoned,
            "view rebuilt"
        );

        let view = Arc::new(outcome.view);
        self.views.send_replace(view.clone());
        view
    }
}

async fn write(local: &SharedLog, value: StoredValue) -> Result<()> {
    let bytes = value.to_bytes()?;
    local.append(&value.id().to_key(), &bytes).await?;
    Ok(())
}

async fn accept_loop(
    mut connections: mpsc::Receiver<Connection>,
    sessions: Arc<SessionManager>,
    shutdown: watch::Receiver<bool>,
    config: SyncConfig,
) {
    let mut running = JoinSet::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            connection = connections.recv(), if accepting => match connection {
                Some(connection) => {
                    let sessions = sessions.clone();
                    let shutdown = shutdown.clone();
                    running.spawn(async move {
                        sessions.bind(connection, shutdown).await;
                    });
                }
                None => {
                    tracing::debug!("overlay stopped delivering connections");
                    accepting = false;
                }
            },
            Some(_) = running.join_next(), if !running.is_empty() => {}
            _ = stopped(shutdown.clone()) => break,
        }
    }

    let drain = async { while running.join_next().await.is_some() {} };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        tracing::warn!(sessions = running.len(), "aborting sessions after shutdown timeout");
        running.abort_all();
        while running.join_next().await.is_some() {}
    }
}

async fn refresh_loop(
    refresh: RefreshSignal,
    rebuilder: Rebuilder,
    shutdown: watch::Receiver<bool>,
    config: SyncConfig,
) {
    loop {
        tokio::select! {
            _ = refresh.requested() => {}
            _ = stopped(shutdown.clone()) => break,
        }

        if !config.refresh_debounce.is_zero() {
            tokio::time::sleep(config.refresh_debounce).await;
        }
        rebuilder.rebuild().await;
    }
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
