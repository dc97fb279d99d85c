use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::queue::JobQueue;

/// Periodically returns expired job leases to the queue so jobs held by a
/// crashed worker are delivered again.
/// - Runs immediately on startup, then every `period`
/// - Stops when `shutdown` flips
pub async fn start_reaper_task(
    queue: Arc<dyn JobQueue>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("[Reaper] Starting lease reaper ({}s interval)", period.as_secs());

    let mut interval = interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match queue.reclaim_expired().await {
            Ok(0) => {}
            Ok(count) => info!("[Reaper] Requeued {} jobs with expired leases", count),
            Err(e) => error!("[Reaper] Failed to reclaim expired leases: {}", e),
        }
    }

    info!("[Reaper] Stopped");
}
