use std::sync::Arc;
use std::time::Duration;

use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::server::ServerShared;

/// Periodically sweeps the pool until a shutdown signal arrives.
///
/// Each tick marks workers whose heartbeat is older than `heartbeat_timeout`
/// unhealthy and evicts the ones past three times that age.
pub(crate) fn spawn_health_monitor(
    shared: Arc<ServerShared>,
    interval: Duration,
    heartbeat_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            heartbeat_timeout_ms = heartbeat_timeout.as_millis() as u64,
            "worker health monitor started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = shared.run_health_check(heartbeat_timeout);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), workers = ?evicted, "evicted dead workers");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("worker health monitor stopping");
                    break;
                }
            }
        }
    })
}
