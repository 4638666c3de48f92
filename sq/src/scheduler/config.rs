//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::Priority;

/// Request scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker count and in-flight bound for raw external calls
    #[serde(rename = "max-concurrent-requests", default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Pending items accepted before submissions are rejected
    #[serde(rename = "max-queue-size", default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Per-attempt timeout when a request does not set one
    #[serde(rename = "default-timeout-ms", default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Retry budget when a request does not set one
    #[serde(rename = "default-max-retries", default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Priority for requests that do not set one
    #[serde(rename = "default-priority", default)]
    pub default_priority: Priority,

    /// Unit of the exponential backoff (delay = base * 2^retry)
    #[serde(rename = "backoff-base-ms", default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay
    #[serde(rename = "backoff-cap-ms", default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// How long an idle worker waits on the queue before re-checking shutdown
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Threads available to blocking work at once
    #[serde(rename = "blocking-threads", default = "default_blocking_threads")]
    pub blocking_threads: usize,

    /// How long stop() waits for workers to unwind
    #[serde(rename = "shutdown-timeout-secs", default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Terminal results kept for `await_result`; the oldest are dropped first
    #[serde(rename = "result-retention", default = "default_result_retention")]
    pub result_retention: usize,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_blocking_threads() -> usize {
    4
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_result_retention() -> usize {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            default_timeout_ms: default_timeout_ms(),
            default_max_retries: default_max_retries(),
            default_priority: Priority::Normal,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            blocking_threads: default_blocking_threads(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            result_retention: default_result_retention(),
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
