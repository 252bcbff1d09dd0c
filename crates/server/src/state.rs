use std::sync::Arc;

use tokio::sync::watch;

use courier_dispatch::{DispatchMetrics, GatewayManager};
use courier_store::{MessageQueue, RecipientTracker};

/// Shared handles for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn MessageQueue>,
    pub tracker: Arc<dyn RecipientTracker>,
    pub manager: Arc<GatewayManager>,
    pub metrics: Arc<DispatchMetrics>,
    /// Bumped by `POST /reload`; the boot task watches it and re-reads
    /// gateway/pool configuration from the store.
    pub reload: watch::Sender<u64>,
}

impl AppState {
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        tracker: Arc<dyn RecipientTracker>,
        manager: Arc<GatewayManager>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let (reload, _) = watch::channel(0);
        Self {
            queue,
            tracker,
            manager,
            metrics,
            reload,
        }
    }

    /// Subscribe to reload notifications.
    #[must_use]
    pub fn reload_notifications(&self) -> watch::Receiver<u64> {
        self.reload.subscribe()
    }
}
