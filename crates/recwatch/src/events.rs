//! Watch events and the sinks that receive them.
//!
//! Every observation ends up as a [`WatchEvent`]. The binary routes events to
//! [`TracingSink`], which renders the three log line shapes; tests and
//! embedders can use [`ChannelSink`] to receive the typed events instead.

use std::fmt;

use recwatch_common::Record;
use tokio::sync::mpsc;
use tracing::info;

/// An observation emitted by the summary reporter or the snapshot differ.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Total record count of a collection.
    Summary {
        collection: String,
        total_records: u64,
    },

    /// The differ saw the count move away from its checkpoint.
    CountChanged {
        collection: String,
        previous: u64,
        current: u64,
    },

    /// A record presumed to be new since the previous checkpoint.
    NewRecord { collection: String, record: Record },
}

impl WatchEvent {
    /// Returns the collection this event refers to.
    pub fn collection(&self) -> &str {
        match self {
            WatchEvent::Summary { collection, .. }
            | WatchEvent::CountChanged { collection, .. }
            | WatchEvent::NewRecord { collection, .. } => collection,
        }
    }

    /// Returns true if this event is a new-record notification.
    pub fn is_new_record(&self) -> bool {
        matches!(self, WatchEvent::NewRecord { .. })
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEvent::Summary {
                collection,
                total_records,
            } => write!(
                f,
                "Summary Statistics [{collection}] - Total Records: {total_records}"
            ),
            WatchEvent::CountChanged {
                collection,
                previous,
                current,
            } => write!(
                f,
                "Record count changed [{collection}]. Previous Count: {previous}, Current Count: {current}"
            ),
            WatchEvent::NewRecord { collection, record } => {
                let body = serde_json::to_string(record).map_err(|_| fmt::Error)?;
                write!(f, "New record added [{collection}]: {body}")
            }
        }
    }
}

/// Destination for watch events.
///
/// `emit` must not block: it is called from inside the differ loop and the
/// summary path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WatchEvent);
}

/// Writes each event as an `info` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: WatchEvent) {
        info!(collection = event.collection(), "{}", event);
    }
}

/// Forwards events into an unbounded mpsc channel.
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl ChannelSink {
    /// Creates a sink together with the receiving half.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}
