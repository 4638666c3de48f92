//! Job queue
//!
//! Composite jobs (a scan of one target, say) are queued by priority and run
//! on a small worker pool. Each handler fans its individual API calls out
//! through the shared [`RequestScheduler`](crate::scheduler::RequestScheduler).

mod config;
mod handler;
mod job;
mod manager;
mod resource;
mod tables;

pub use config::JobQueueConfig;
pub use handler::{JobContext, JobHandler};
pub use job::{JobStatus, ScanJob};
pub use manager::JobQueueManager;
pub use resource::{AlwaysAvailable, QuotaResourceMonitor, ResourceMonitor};
pub use tables::QueueStats;
