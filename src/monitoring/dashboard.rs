use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::monitoring::metrics::{log_metrics_snapshot, RunMetrics};

/// Spawn a background task that periodically logs batch progress.
///
/// The caller aborts the returned handle once the batch is done.
pub fn spawn_progress_task(metrics: RunMetrics, period: Duration) -> JoinHandle<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        // The first tick completes immediately; skip it so the first record
        // lands one period into the batch.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_metrics_snapshot(&metrics.snapshot());
        }
    })
}
