//! Background expiry of cached secrets

use crate::cache::SecretCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodic task removing expired entries from a [`SecretCache`]
pub struct CacheSweeper;

impl CacheSweeper {
    /// Start sweeping `cache` every `period` on `runtime`.
    ///
    /// The first sweep happens one full period after start. The task runs
    /// until [`SweeperHandle::stop`] is called or the handle is dropped.
    pub fn spawn(runtime: &Handle, cache: Arc<SecretCache>, period: Duration) -> SweeperHandle {
        let period = period.max(Duration::from_millis(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("Starting cache sweeper (interval: {}s)", period.as_secs());
        let task = runtime.spawn(run(cache, period, shutdown_rx));

        SweeperHandle { shutdown, task }
    }
}

async fn run(cache: Arc<SecretCache>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!("Cache sweep removed {} expired entries", removed);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Cache sweeper stopped");
}

/// Handle to a running sweeper
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Cache sweeper task failed: {}", e);
        }
    }

    /// Check whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
