//! ScanQueue - priority request scheduling with rate-limit admission
//!
//! ScanQueue runs many independent calls against a rate-limited external
//! API on behalf of long-running composite jobs.
//!
//! # Core Concepts
//!
//! - **Work items**: prioritized, retryable callables run by the
//!   [`RequestScheduler`] under a bound on in-flight calls
//! - **Admission control**: quota fed back from live responses decides when a
//!   dispatch may go out, without any external coordination service
//! - **Jobs**: multi-phase operations queued by the [`JobQueueManager`], each
//!   fanning its calls out through the shared scheduler
//!
//! # Modules
//!
//! - [`scheduler`] - Request queue, workers, retries and backoff
//! - [`ratelimit`] - Per-class quota state and admission decisions
//! - [`jobs`] - Job lifecycle, handlers, resource gating and stats
//! - [`runtime`] - Wires the services together from [`Config`]
//! - [`config`] - Configuration types and loading
//! - [`telemetry`] - Logging setup

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod ratelimit;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use domain::Priority;
pub use error::SchedulerError;
pub use jobs::{
    AlwaysAvailable, JobContext, JobHandler, JobQueueConfig, JobQueueManager, JobStatus, QueueStats,
    QuotaResourceMonitor, ResourceMonitor, ScanJob,
};
pub use ratelimit::{
    AdmissionConfig, AdmissionWait, ExhaustedPolicy, QuotaMetadata, RateLimitAdmissionController, RateLimitState,
};
pub use runtime::Runtime;
pub use scheduler::{
    Failure, RequestResult, RequestScheduler, SchedulerConfig, SchedulerStats, Work, WorkOutput, WorkRequest,
    WorkResult, backoff_delay,
};
pub use telemetry::setup_logging;
