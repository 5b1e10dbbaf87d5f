//! The two periodic tasks driving the sync engine
//!
//! The list refresh keeps the descriptor tier current and the sync task
//! reconciles every tracked resource. Both tick immediately on start and stop
//! together when the shared token is cancelled. A failed tick is logged and
//! retried on the next one.

use crate::cache::SecretCache;
use crate::config::SyncConfig;
use crate::reconciler::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Refresh the remote secret list every `interval` until cancelled.
pub async fn run_list_refresh(
    cache: Arc<SecretCache>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "Starting secret list refresh");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                // Errors are logged by the cache, the previous list stays in use
                let _ = cache.refresh_list().await;
            }
        }
    }
    info!("Secret list refresh stopped");
}

/// Reconcile every tracked resource every `interval` until cancelled.
pub async fn run_sync(reconciler: Arc<Reconciler>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "Starting sync loop");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = reconciler.sync_all().await;
                debug!(
                    written = report.written,
                    unchanged = report.unchanged,
                    failed = report.failed,
                    "Sync tick finished"
                );
            }
        }
    }
    info!("Sync loop stopped");
}

/// Spawn both timers with the intervals from `config`.
pub fn spawn(
    cache: Arc<SecretCache>,
    reconciler: Arc<Reconciler>,
    config: &SyncConfig,
    shutdown: CancellationToken,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let list = tokio::spawn(run_list_refresh(
        cache,
        config.list_interval,
        shutdown.clone(),
    ));
    let sync = tokio::spawn(run_sync(reconciler, config.sync_interval, shutdown));
    (list, sync)
}
