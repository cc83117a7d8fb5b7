//! Snapshot differ: detects collection growth and surfaces new records.
//!
//! The differ keeps a checkpoint (the last observed count) and polls the
//! gateway on its own interval, independent of the scheduler. When the count
//! moves, it resolves which records are new and emits them.
//!
//! ## Novelty policies
//!
//! - **Position** (default): the store is fetched in full and everything at
//!   positions `[last_count, len)` is considered new. Fragile if the store
//!   reorders or deletes, but needs nothing from the records.
//! - **High-water mark**: with `watermark_column` set, only records whose
//!   numeric column exceeds the last seen maximum are fetched.
//!
//! Both policies use the count as the change trigger, so a poll where two
//! records were inserted and two deleted goes unnoticed.
//!
//! ## Failure handling
//!
//! A failed count or fetch leaves the checkpoint untouched, so the same delta
//! is detected again on the next poll. Consecutive failures extend the wait
//! with an exponential backoff; any successful poll resets it.

use std::sync::Arc;
use std::time::Duration;

use recwatch_common::{watermark_of, CollectionGateway, Record, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventSink, WatchEvent};
use crate::stats::WatchStats;

/// Errors that end a differ before it starts polling.
#[derive(Debug, Error)]
pub enum DifferError {
    #[error("Initial checkpoint query failed: {0}")]
    Init(#[from] StoreError),

    #[error("Cancelled")]
    Cancelled,
}

/// Configuration for a snapshot differ.
#[derive(Debug, Clone)]
pub struct DifferConfig {
    /// Wait between polls when the store is healthy.
    pub poll_interval: Duration,
    /// Extra wait added after the first consecutive failure.
    pub initial_backoff: Duration,
    /// Upper bound for the extra wait.
    pub max_backoff: Duration,
    /// Numeric column used as a high-water mark instead of positions.
    pub watermark_column: Option<String>,
}

impl Default for DifferConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
            watermark_column: None,
        }
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The differ had no checkpoint yet and took one.
    Seeded { count: u64 },
    /// Count matches the checkpoint.
    Unchanged { count: u64 },
    /// The count query failed; nothing changed.
    CountFailed,
    /// The count moved but the records could not be fetched; the checkpoint
    /// stays at `previous` so the delta is retried.
    FetchFailed { previous: u64, current: u64 },
    /// The count moved and the checkpoint advanced to `current`.
    Changed {
        previous: u64,
        current: u64,
        new_records: usize,
    },
    /// Cancellation was observed during a store call.
    Cancelled,
}

impl StepOutcome {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            StepOutcome::CountFailed | StepOutcome::FetchFailed { .. }
        )
    }
}

/// Per-collection change detector owning its own checkpoint.
pub struct SnapshotDiffer {
    gateway: Arc<dyn CollectionGateway>,
    sink: Arc<dyn EventSink>,
    stats: Arc<WatchStats>,
    config: DifferConfig,
    last_count: Option<u64>,
    watermark: Option<u64>,
    backoff: Option<Duration>,
    consecutive_failures: u32,
}

impl SnapshotDiffer {
    pub fn new(
        gateway: Arc<dyn CollectionGateway>,
        sink: Arc<dyn EventSink>,
        stats: Arc<WatchStats>,
        config: DifferConfig,
    ) -> Self {
        Self {
            gateway,
            sink,
            stats,
            config,
            last_count: None,
            watermark: None,
            backoff: None,
            consecutive_failures: 0,
        }
    }

    /// Starts from a known checkpoint instead of querying the store.
    pub fn with_checkpoint(mut self, last_count: u64) -> Self {
        self.last_count = Some(last_count);
        self
    }

    pub fn collection(&self) -> &str {
        self.gateway.collection()
    }

    /// The count observed at the end of the last successful poll.
    pub fn last_count(&self) -> Option<u64> {
        self.last_count
    }

    /// The highest watermark value seen, in high-water-mark mode.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Wait before the next poll: the poll interval plus any backoff.
    pub fn next_delay(&self) -> Duration {
        self.config.poll_interval + self.backoff.unwrap_or_default()
    }

    /// Seeds the checkpoint from a live count.
    pub async fn init(&mut self, cancel: &CancellationToken) -> Result<u64, DifferError> {
        let count = guarded(cancel, self.gateway.count())
            .await
            .ok_or(DifferError::Cancelled)??;

        if let Some(column) = self.config.watermark_column.clone() {
            let mark = guarded(cancel, self.gateway.max_value(&column))
                .await
                .ok_or(DifferError::Cancelled)??;
            self.watermark = mark;
            debug!(
                "Seeded high-water mark for {}: {:?}",
                self.collection(),
                mark
            );
        }

        self.last_count = Some(count);
        Ok(count)
    }

    /// Polls the store once and updates the checkpoint.
    pub async fn step(&mut self, cancel: &CancellationToken) -> StepOutcome {
        let outcome = self.poll(cancel).await;
        self.record_outcome(&outcome);
        outcome
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> StepOutcome {
        let Some(previous) = self.last_count else {
            return match self.init(cancel).await {
                Ok(count) => StepOutcome::Seeded { count },
                Err(DifferError::Cancelled) => StepOutcome::Cancelled,
                Err(e) => {
                    WatchStats::incr(&self.stats.count_failures);
                    error!("Error counting records in {}: {}", self.collection(), e);
                    StepOutcome::CountFailed
                }
            };
        };

        let current = match guarded(cancel, self.gateway.count()).await {
            None => return StepOutcome::Cancelled,
            Some(Ok(count)) => count,
            Some(Err(e)) => {
                WatchStats::incr(&self.stats.count_failures);
                error!("Error counting records in {}: {}", self.collection(), e);
                return StepOutcome::CountFailed;
            }
        };

        if current == previous {
            return StepOutcome::Unchanged { count: current };
        }

        let new_records = match self.resolve(previous, cancel).await {
            None => return StepOutcome::Cancelled,
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                WatchStats::incr(&self.stats.fetch_failures);
                error!("Error fetching new records from {}: {}", self.collection(), e);
                return StepOutcome::FetchFailed { previous, current };
            }
        };

        let collection = self.collection().to_string();
        self.sink.emit(WatchEvent::CountChanged {
            collection: collection.clone(),
            previous,
            current,
        });
        let emitted = new_records.len();
        for record in new_records {
            self.sink.emit(WatchEvent::NewRecord {
                collection: collection.clone(),
                record,
            });
        }

        WatchStats::incr(&self.stats.changes_detected);
        self.stats
            .new_records
            .fetch_add(emitted as u64, std::sync::atomic::Ordering::Relaxed);
        self.last_count = Some(current);

        StepOutcome::Changed {
            previous,
            current,
            new_records: emitted,
        }
    }

    /// Fetches the records considered new relative to the checkpoint.
    ///
    /// Returns `None` when cancelled.
    async fn resolve(
        &mut self,
        previous: u64,
        cancel: &CancellationToken,
    ) -> Option<Result<Vec<Record>, StoreError>> {
        let Some(column) = self.config.watermark_column.clone() else {
            let fetched = guarded(cancel, self.gateway.fetch_all()).await?;
            return Some(fetched.map(|all| records_after_position(all, previous)));
        };

        let fetched = match self.watermark {
            Some(mark) => guarded(cancel, self.gateway.fetch_after(&column, mark)).await?,
            // Empty at seed time: everything carrying the column is new.
            None => guarded(cancel, self.gateway.fetch_all())
                .await?
                .map(|all| {
                    all.into_iter()
                        .filter(|r| watermark_of(r, &column).is_some())
                        .collect()
                }),
        };

        Some(fetched.map(|records| {
            let high = records.iter().filter_map(|r| watermark_of(r, &column)).max();
            self.watermark = self.watermark.max(high);
            records
        }))
    }

    fn record_outcome(&mut self, outcome: &StepOutcome) {
        if outcome.is_failure() {
            self.consecutive_failures += 1;
            let next = match self.backoff {
                None => self.config.initial_backoff,
                Some(d) => d.saturating_mul(2),
            };
            self.backoff = Some(next.min(self.config.max_backoff));
            warn!(
                "Poll of {} failed ({} in a row), next attempt in {:?}",
                self.collection(),
                self.consecutive_failures,
                self.next_delay()
            );
        } else if !matches!(outcome, StepOutcome::Cancelled) {
            self.consecutive_failures = 0;
            self.backoff = None;
        }
    }

    /// Runs the free-running poll loop until `cancel` fires.
    ///
    /// Returns early, without polling, if the initial count fails.
    pub async fn run(mut self, cancel: CancellationToken) {
        let seeded = match self.last_count {
            Some(count) => count,
            None => match self.init(&cancel).await {
                Ok(count) => count,
                Err(DifferError::Cancelled) => return,
                Err(e) => {
                    WatchStats::incr(&self.stats.count_failures);
                    error!("Change detection for {} not started: {}", self.collection(), e);
                    return;
                }
            },
        };

        info!(
            "Watching {} for new records every {:?} (checkpoint {})",
            self.collection(),
            self.config.poll_interval,
            seeded
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {}
                _ = cancel.cancelled() => break,
            }

            if matches!(self.step(&cancel).await, StepOutcome::Cancelled) {
                break;
            }
        }

        info!("Change detection for {} stopped", self.collection());
    }
}

/// Selects the records after the checkpoint position.
///
/// A checkpoint at or past the end yields nothing.
fn records_after_position(mut all: Vec<Record>, previous: u64) -> Vec<Record> {
    match usize::try_from(previous) {
        Ok(start) if start < all.len() => all.split_off(start),
        _ => Vec::new(),
    }
}

/// Awaits `fut` unless `cancel` fires first.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
