//! Summary reporter: one total-count event per invocation.

use std::sync::Arc;

use recwatch_common::CollectionGateway;
use tracing::error;

use crate::events::{EventSink, WatchEvent};
use crate::stats::WatchStats;

/// Emits the current record count of a collection.
///
/// Stateless between invocations. A failed count only skips this
/// invocation's summary.
pub struct SummaryReporter {
    gateway: Arc<dyn CollectionGateway>,
    sink: Arc<dyn EventSink>,
    stats: Arc<WatchStats>,
}

impl SummaryReporter {
    pub fn new(
        gateway: Arc<dyn CollectionGateway>,
        sink: Arc<dyn EventSink>,
        stats: Arc<WatchStats>,
    ) -> Self {
        Self {
            gateway,
            sink,
            stats,
        }
    }

    /// Counts the collection once and emits a summary.
    ///
    /// Returns the reported total, or `None` if the count failed.
    pub async fn report(&self) -> Option<u64> {
        let collection = self.gateway.collection();
        match self.gateway.count().await {
            Ok(total_records) => {
                WatchStats::incr(&self.stats.summaries);
                self.sink.emit(WatchEvent::Summary {
                    collection: collection.to_string(),
                    total_records,
                });
                Some(total_records)
            }
            Err(e) => {
                WatchStats::incr(&self.stats.summary_failures);
                error!("Error counting records in {}: {}", collection, e);
                None
            }
        }
    }
}
