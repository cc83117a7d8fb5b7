//! Observation scheduler.
//!
//! Each firing runs the summary reporter for every watched collection and,
//! in parallel, makes sure each collection has exactly one differ loop. The
//! firing is complete once both contributions are done; differ loops keep
//! running across firings on their own poll interval.
//!
//! ```text
//! firing ──┬── SummaryReporter::report (per collection) ──┐
//!          └── ensure differ loop (per collection) ───────┴── join
//!                    │
//!                    └── SnapshotDiffer::run (free-running, one per collection)
//! ```
//!
//! `stop` only prevents future firings. `shutdown` additionally cancels the
//! differ loops and waits, up to a grace period, for everything to finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use recwatch_common::CollectionGateway;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::differ::{DifferConfig, SnapshotDiffer};
use crate::events::EventSink;
use crate::schedule::Recurrence;
use crate::stats::WatchStats;
use crate::summary::SummaryReporter;

/// One watched collection: its reporter and its (at most one) differ loop.
pub struct WatchTarget {
    reporter: SummaryReporter,
    gateway: Arc<dyn CollectionGateway>,
    sink: Arc<dyn EventSink>,
    stats: Arc<WatchStats>,
    differ_config: DifferConfig,
    differ: Mutex<Option<JoinHandle<()>>>,
}

impl WatchTarget {
    pub fn new(
        gateway: Arc<dyn CollectionGateway>,
        sink: Arc<dyn EventSink>,
        stats: Arc<WatchStats>,
        differ_config: DifferConfig,
    ) -> Self {
        let reporter = SummaryReporter::new(
            Arc::clone(&gateway),
            Arc::clone(&sink),
            Arc::clone(&stats),
        );
        Self {
            reporter,
            gateway,
            sink,
            stats,
            differ_config,
            differ: Mutex::new(None),
        }
    }

    pub fn collection(&self) -> &str {
        self.gateway.collection()
    }

    /// Returns true while this target's differ loop is alive.
    pub fn differ_running(&self) -> bool {
        self.differ
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts the differ loop unless one is already running.
    ///
    /// A loop that ended (e.g. its initial count failed) is replaced.
    /// Returns true if a new loop was spawned.
    fn ensure_differ(&self, cancel: &CancellationToken) -> bool {
        let mut slot = self.differ.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) || cancel.is_cancelled() {
            return false;
        }

        let differ = SnapshotDiffer::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
            self.differ_config.clone(),
        );
        *slot = Some(tokio::spawn(differ.run(cancel.clone())));
        WatchStats::incr(&self.stats.differs_started);
        debug!("Started differ loop for {}", self.collection());
        true
    }

    fn take_differ(&self) -> Option<JoinHandle<()>> {
        self.differ.lock().take()
    }
}

/// What a single firing did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FiringReport {
    /// Reported total per collection; `None` where the count failed.
    pub summaries: Vec<(String, Option<u64>)>,
    /// Number of differ loops spawned by this firing.
    pub differs_started: usize,
}

/// Fires observation cycles on a recurrence.
pub struct ObservationScheduler {
    recurrence: Recurrence,
    targets: Arc<Vec<WatchTarget>>,
    stats: Arc<WatchStats>,
    stop: CancellationToken,
    differ_cancel: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl ObservationScheduler {
    pub fn new(recurrence: Recurrence, targets: Vec<WatchTarget>, stats: Arc<WatchStats>) -> Self {
        Self {
            recurrence,
            targets: Arc::new(targets),
            stats,
            stop: CancellationToken::new(),
            differ_cancel: CancellationToken::new(),
            runner: Mutex::new(None),
        }
    }

    pub fn targets(&self) -> &[WatchTarget] {
        &self.targets
    }

    /// Returns true between `start` and the end of the firing loop.
    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Runs one firing immediately and waits for its join point.
    pub async fn fire(&self) -> FiringReport {
        fire_targets(&self.targets, &self.differ_cancel, &self.stats).await
    }

    /// Begins accepting firings on a background task.
    ///
    /// Has no effect if already running or after `stop`.
    pub fn start(&self) {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            warn!("Scheduler already started");
            return;
        }
        if self.stop.is_cancelled() {
            warn!("Scheduler was stopped and cannot be restarted");
            return;
        }

        info!(
            "Starting scheduler ({}) for {} collection(s)",
            self.recurrence,
            self.targets.len()
        );
        *runner = Some(tokio::spawn(run_firings(
            self.recurrence.clone(),
            Arc::clone(&self.targets),
            self.differ_cancel.clone(),
            Arc::clone(&self.stats),
            self.stop.clone(),
        )));
    }

    /// Ceases future firings. In-flight firings and differ loops keep going.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Scheduler stopping: no further firings");
            self.stop.cancel();
        }
    }

    /// Stops firings, cancels differ loops, and waits up to `grace` for
    /// in-flight work.
    ///
    /// Returns false if the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stop();
        self.differ_cancel.cancel();

        let mut handles: Vec<JoinHandle<()>> = self.runner.lock().take().into_iter().collect();
        handles.extend(self.targets.iter().filter_map(WatchTarget::take_differ));

        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Task failed during shutdown: {}", e);
                    }
                }
                info!("All tasks completed");
                true
            }
            Err(_) => {
                warn!("Shutdown grace period of {:?} exceeded", grace);
                false
            }
        }
    }
}

async fn fire_targets(
    targets: &[WatchTarget],
    differ_cancel: &CancellationToken,
    stats: &WatchStats,
) -> FiringReport {
    WatchStats::incr(&stats.firings);

    let summaries = join_all(targets.iter().map(|target| async move {
        (target.collection().to_string(), target.reporter.report().await)
    }));
    let differs = async {
        targets
            .iter()
            .filter(|target| target.ensure_differ(differ_cancel))
            .count()
    };

    let (summaries, differs_started) = tokio::join!(summaries, differs);
    FiringReport {
        summaries,
        differs_started,
    }
}

async fn run_firings(
    recurrence: Recurrence,
    targets: Arc<Vec<WatchTarget>>,
    differ_cancel: CancellationToken,
    stats: Arc<WatchStats>,
    stop: CancellationToken,
) {
    let mut firings = JoinSet::new();
    let mut previous = None;

    loop {
        let Some((at, delay)) = recurrence.next_firing(Utc::now(), previous) else {
            info!("Schedule {} has no further firings", recurrence);
            break;
        };
        previous = Some(at);

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        while let Some(done) = firings.try_join_next() {
            if let Err(e) = done {
                error!("Firing task failed: {}", e);
            }
        }

        let targets = Arc::clone(&targets);
        let differ_cancel = differ_cancel.clone();
        let stats = Arc::clone(&stats);
        firings.spawn(async move {
            let report = fire_targets(&targets, &differ_cancel, &stats).await;
            debug!("Firing complete: {:?}", report);
        });
    }

    while let Some(done) = firings.join_next().await {
        if let Err(e) = done {
            error!("Firing task failed: {}", e);
        }
    }
    debug!("Firing loop exited");
}
