//! In-process control surface: full-sync trigger and published health.

use tokio::sync::{mpsc, watch};

use datasync_primitives::{FullSyncStatus, SyncEventsHealth};

/// Cloneable handle exposed to whatever owns the external control surface.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    pub(crate) full_sync_tx: mpsc::Sender<()>,
    pub(crate) status_rx: watch::Receiver<FullSyncStatus>,
    pub(crate) health_rx: watch::Receiver<SyncEventsHealth>,
}

impl ControlHandle {
    /// Request a full-sync campaign. Returns `false` when the engine is gone.
    pub async fn trigger_full_sync(&self) -> bool {
        self.full_sync_tx.send(()).await.is_ok()
    }

    #[must_use]
    pub fn full_sync_status(&self) -> FullSyncStatus {
        *self.status_rx.borrow()
    }

    #[must_use]
    pub fn sync_events_health(&self) -> SyncEventsHealth {
        *self.health_rx.borrow()
    }
}
