//! GcLoop - periodic purge of finished tasks past retention.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::table::TaskTable;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Retention {
    /// For tasks whose result was consumed or delivered.
    pub released: Duration,
    /// For finished tasks nobody collected.
    pub orphaned: Duration,
    pub interval: Duration,
}

/// Handle to the running GC loop. Dropping `shutdown_tx` also stops it.
pub(crate) struct GcLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl GcLoop {
    pub fn spawn(table: Arc<TaskTable>, retention: Retention) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.interval);
            // the first tick fires immediately; nothing to purge yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let purged = table.purge(retention.released, retention.orphaned);
                        if purged > 0 {
                            tracing::debug!(purged, remaining = table.len(), "purged finished tasks");
                        }
                    }
                }
            }
        });
        Self { shutdown_tx, join }
    }

    pub async fn stop(self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
