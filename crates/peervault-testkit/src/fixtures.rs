//! Test fixtures and helpers.
//!
//! A [`TestNetwork`] is one identity on one in-memory overlay. Every
//! [`TestDevice`] it hands out shares the identity seed but has its own
//! store and a manual clock, so devices find each other and timestamps are
//! under the test's control.

use std::sync::Arc;
use std::time::Duration;

use peervault::{Result, Vault, VaultConfig};
use peervault_core::{IdentitySeed, ManualClock, Timestamp};
use peervault_store::{LogStore, MemoryStore};
use peervault_sync::overlay::memory::MemoryNetwork;
use peervault_sync::{MergedView, SyncConfig};

/// How long [`wait_for`] waits before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Clock start for new devices.
pub const START_MILLIS: i64 = 1_000;

/// One identity on a fresh memory overlay.
pub struct TestNetwork {
    pub network: Arc<MemoryNetwork>,
    pub seed: IdentitySeed,
}

impl TestNetwork {
    /// A network whose connections go through key exchange.
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            seed: IdentitySeed::random(),
        }
    }

    /// A network that surfaces peer log identities on connect.
    pub fn with_log_discovery() -> Self {
        Self {
            network: MemoryNetwork::with_log_discovery(),
            seed: IdentitySeed::random(),
        }
    }

    /// Start a device with the default config and no refresh debounce.
    pub async fn device(&self) -> Result<TestDevice> {
        self.device_with(test_config()).await
    }

    /// Start a device with `config`.
    pub async fn device_with(&self, config: VaultConfig) -> Result<TestDevice> {
        self.device_on(Arc::new(MemoryStore::new()), config).await
    }

    /// Start a device over an existing store.
    pub async fn device_on(&self, store: Arc<dyn LogStore>, config: VaultConfig) -> Result<TestDevice> {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(START_MILLIS)));
        let vault = Vault::new(store.clone(), Arc::new(self.network.swarm()), config)
            .with_clock(clock.clone());
        vault.start(&self.seed).await?;
        Ok(TestDevice { vault, clock, store })
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A started vault plus the handles a test needs to steer it.
pub struct TestDevice {
    pub vault: Vault,
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn LogStore>,
}

impl TestDevice {
    /// Pin the clock to `millis`.
    pub fn at(&self, millis: i64) -> &Self {
        self.clock.set(Timestamp::from_millis(millis));
        self
    }
}

/// Default vault config with merges running as soon as they are requested.
pub fn test_config() -> VaultConfig {
    VaultConfig::default().with_sync(SyncConfig::default().with_refresh_debounce(Duration::ZERO))
}

/// Wait until the published view of `vault` satisfies `predicate`.
///
/// Returns the matching view, or `None` after [`WAIT_TIMEOUT`].
pub async fn wait_for<F>(vault: &Vault, predicate: F) -> Option<Arc<MergedView>>
where
    F: Fn(&MergedView) -> bool,
{
    let mut views = vault.subscribe();
    let matched = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let view = views.borrow_and_update().clone();
            if predicate(&view) {
                return Some(view);
            }
            if views.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;
    matched.ok().flatten()
}

/// Wait until `vault` has `count` registered peers.
pub async fn wait_for_peers(vault: &Vault, count: usize) -> bool {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            if vault.peers().await.map(|p| p.len()).unwrap_or(0) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
