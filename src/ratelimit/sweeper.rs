//! Background eviction of idle per-client state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::coordinator::RateLimitCoordinator;

/// Periodic reaper bounding the memory used by per-client state.
pub struct EvictionSweeper;

impl EvictionSweeper {
    /// Spawn the sweep loop on the current runtime.
    ///
    /// Each tick snapshots tracked keys and removes idle entries one at a
    /// time, so admission checks are never stalled for the duration of a
    /// sweep. The loop runs until the returned handle is shut down.
    pub fn spawn(coordinator: Arc<RateLimitCoordinator>) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = coordinator.sweep_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = coordinator.sweep(Instant::now());
                        if removed > 0 {
                            debug!(
                                removed,
                                tracked = coordinator.tracked_clients(),
                                "evicted idle client state"
                            );
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!("eviction sweeper stopping");
                        break;
                    }
                }
            }
        });

        SweeperHandle { stop_tx, task }
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }

    /// Abort the sweeper without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }
}
