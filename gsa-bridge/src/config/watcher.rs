//! Periodic check of the configuration file's modification time.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::store::ConfigStore;

/// Default interval between modification checks.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn a task calling [`ConfigStore::ensure_latest_config_loaded`] every
/// `interval` until `cancel` fires.
pub fn spawn_config_watcher(
    store: Arc<ConfigStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the file was just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Configuration watcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if store.ensure_latest_config_loaded().await {
                        info!("Configuration file reloaded");
                    }
                }
            }
        }
    })
}
