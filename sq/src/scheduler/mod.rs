//! Request scheduler
//!
//! Accepts prioritized, retryable work items and runs them on a bounded
//! worker pool, consulting rate-limit admission before each dispatch.

mod backoff;
mod config;
mod core;
mod queue;
mod work;

pub use backoff::backoff_delay;
pub use config::SchedulerConfig;
pub use core::RequestScheduler;
pub use queue::{Failure, QueuedItem, RequestResult, SchedulerStats, WorkItem};
pub use work::{Work, WorkOutput, WorkRequest, WorkResult};
