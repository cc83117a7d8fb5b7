//! recwatch: periodic observation of a record collection.
//!
//! This crate provides:
//! - An observation scheduler firing on a fixed interval or cron expression
//! - A summary reporter emitting total record counts
//! - A snapshot differ detecting new records from count growth
//!
//! ## Modules
//!
//! - `config`: Configuration loading and validation
//! - `schedule`: Recurrence expression parsing
//! - `scheduler`: Firing loop, watch targets, lifecycle
//! - `summary`: Total-count reporting
//! - `differ`: Checkpointed change detection
//! - `events`: Watch events and sinks
//! - `stats`: Health counters

pub mod config;
pub mod differ;
pub mod events;
pub mod schedule;
pub mod scheduler;
pub mod stats;
pub mod summary;

pub use config::{CliOverrides, WatchConfig};
pub use differ::{DifferConfig, DifferError, SnapshotDiffer, StepOutcome};
pub use events::{ChannelSink, EventSink, TracingSink, WatchEvent};
pub use schedule::{Recurrence, ScheduleError};
pub use scheduler::{FiringReport, ObservationScheduler, WatchTarget};
pub use stats::{join_health_logger, spawn_health_logger, WatchStats, WatchStatsSnapshot};
pub use summary::SummaryReporter;
