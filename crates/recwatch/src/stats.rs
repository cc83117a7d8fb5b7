//! Health counters shared by the scheduler, reporter and differs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Running totals for monitoring, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct WatchStats {
    pub firings: AtomicU64,
    pub summaries: AtomicU64,
    pub summary_failures: AtomicU64,
    pub count_failures: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub changes_detected: AtomicU64,
    pub new_records: AtomicU64,
    pub differs_started: AtomicU64,
}

impl WatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> WatchStatsSnapshot {
        WatchStatsSnapshot {
            firings: self.firings.load(Ordering::Relaxed),
            summaries: self.summaries.load(Ordering::Relaxed),
            summary_failures: self.summary_failures.load(Ordering::Relaxed),
            count_failures: self.count_failures.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            changes_detected: self.changes_detected.load(Ordering::Relaxed),
            new_records: self.new_records.load(Ordering::Relaxed),
            differs_started: self.differs_started.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let s = self.snapshot();
        info!(
            "Health: firings={}, summaries={}, changes={}, new_records={}, differs_started={}, errors={}",
            s.firings,
            s.summaries,
            s.changes_detected,
            s.new_records,
            s.differs_started,
            s.total_errors(),
        );
    }
}

/// Logs `stats` every `log_interval` until `cancel` fires.
pub fn spawn_health_logger(
    stats: Arc<WatchStats>,
    log_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(log_interval);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    stats.log_stats();
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
    })
}

/// Waits for the health logger to exit, logging a panic or abort.
///
/// Returns false if the task did not finish cleanly.
pub async fn join_health_logger(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!("Health task failed: {}", e);
            false
        }
    }
}

/// Point-in-time copy of [`WatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStatsSnapshot {
    pub firings: u64,
    pub summaries: u64,
    pub summary_failures: u64,
    pub count_failures: u64,
    pub fetch_failures: u64,
    pub changes_detected: u64,
    pub new_records: u64,
    pub differs_started: u64,
}

impl WatchStatsSnapshot {
    /// All store errors seen by any component.
    pub fn total_errors(&self) -> u64 {
        self.summary_failures + self.count_failures + self.fetch_failures
    }
}
