//! Coalescing refresh requests.

use std::sync::Arc;

use tokio::sync::Notify;

/// Asks the controller for a merge pass.
///
/// Requests made while no pass is waiting collapse into one: a burst of
/// appends schedules a single rebuild.
#[derive(Debug, Clone, Default)]
pub struct RefreshSignal {
    notify: Arc<Notify>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a merge pass.
    pub fn request(&self) {
        self.notify.notify_one();
    }

    /// Wait until at least one pass has been requested.
    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}
