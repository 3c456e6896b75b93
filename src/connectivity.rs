//! Background replay of the offline queue when the device reconnects.

use std::sync::Arc;

use groupcal_core::{Connectivity, ConnectivityObserver, EventBackend, KeyValueStorage};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::MutationCoordinator;

/// Watches connectivity and flushes the offline queue on every
/// offline-to-online transition. The task stops when the watcher is dropped.
pub struct ConnectivityWatcher {
    task: JoinHandle<()>,
}

impl ConnectivityWatcher {
    pub fn spawn<B, S>(
        observer: &dyn ConnectivityObserver,
        coordinator: Arc<MutationCoordinator<B, S>>,
    ) -> Self
    where
        B: EventBackend,
        S: KeyValueStorage,
    {
        let mut rx = observer.watch();
        let task = tokio::spawn(async move {
            let mut last = *rx.borrow_and_update();
            if last == Connectivity::Online {
                // Entries may have been persisted by an earlier session
                flush(&coordinator).await;
            }

            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if state == last {
                    continue;
                }
                info!(from = ?last, to = ?state, "connectivity changed");
                if last == Connectivity::Offline && state == Connectivity::Online {
                    flush(&coordinator).await;
                }
                last = state;
            }
            debug!("connectivity source closed");
        });
        ConnectivityWatcher { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ConnectivityWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn flush<B: EventBackend, S: KeyValueStorage>(coordinator: &MutationCoordinator<B, S>) {
    match coordinator.flush().await {
        Ok(report) if report.failed.is_some() => {
            warn!(remaining = report.remaining, "offline queue replay stopped early");
        }
        Ok(report) => debug!(replayed = report.replayed, "offline queue replayed"),
        Err(e) => warn!(error = %e, "could not replay offline queue"),
    }
}
