//! Job queue configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Jobs running at once; kept well below the request bound since each job fans out
    #[serde(rename = "max-concurrent-jobs", default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Queued jobs accepted before submissions are rejected
    #[serde(rename = "max-queue-size", default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Delay before re-queueing a job the resource monitor turned away
    #[serde(rename = "resource-retry-delay-ms", default = "default_resource_retry_delay_ms")]
    pub resource_retry_delay_ms: u64,

    /// Finished jobs kept for status queries and stats
    #[serde(rename = "history-capacity", default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Fail a job whose handler runs longer than this
    #[serde(rename = "job-timeout-secs", default)]
    pub job_timeout_secs: Option<u64>,

    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(rename = "shutdown-timeout-secs", default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// How long the quota-aware resource monitor caches its answer
    #[serde(rename = "resource-cache-secs", default = "default_resource_cache_secs")]
    pub resource_cache_secs: u64,
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_max_queue_size() -> usize {
    100
}

fn default_resource_retry_delay_ms() -> u64 {
    5000
}

fn default_history_capacity() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_resource_cache_secs() -> u64 {
    60
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_size: default_max_queue_size(),
            resource_retry_delay_ms: default_resource_retry_delay_ms(),
            history_capacity: default_history_capacity(),
            job_timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            resource_cache_secs: default_resource_cache_secs(),
        }
    }
}

impl JobQueueConfig {
    pub fn resource_retry_delay(&self) -> Duration {
        Duration::from_millis(self.resource_retry_delay_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn resource_cache(&self) -> Duration {
        Duration::from_secs(self.resource_cache_secs)
    }
}
