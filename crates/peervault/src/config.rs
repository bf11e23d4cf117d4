//! Vault configuration.

use peervault_sync::SyncConfig;

/// Name of the local log when none is configured.
pub const DEFAULT_LOG_NAME: &str = "vault";

/// What `delete` writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Write a tombstone that outranks older copies on every device.
    #[default]
    Tombstone,
    /// Only drop the key from the local log. A copy still held in a peer's
    /// log shows up again on the next merge.
    Lossy,
}

/// Configuration for a [`Vault`](crate::Vault).
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Logical name of the local log, also sent in key exchange frames.
    pub log_name: String,
    /// Delete behavior.
    pub delete_policy: DeletePolicy,
    /// Sync configuration.
    pub sync: SyncConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            log_name: DEFAULT_LOG_NAME.to_string(),
            delete_policy: DeletePolicy::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl VaultConfig {
    pub fn with_log_name(mut self, name: impl Into<String>) -> Self {
        self.log_name = name.into();
        self
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}
