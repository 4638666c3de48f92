//! Queue and result types for the request scheduler

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::Priority;
use crate::error::SchedulerError;

use super::config::SchedulerConfig;
use super::work::{Work, WorkRequest};

/// A submitted unit of work, owned by the scheduler until it is terminal
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub work: Work,
    pub priority: Priority,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_count: u32,
    pub rate_limit_class: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Build an item from a request, filling gaps from the config
    pub fn from_request(request: WorkRequest, config: &SchedulerConfig) -> Self {
        Self {
            id: request.id,
            work: request.work,
            priority: request.priority.unwrap_or(config.default_priority),
            timeout: request.timeout.unwrap_or_else(|| config.default_timeout()),
            max_retries: request.max_retries.unwrap_or(config.default_max_retries),
            retry_count: 0,
            rate_limit_class: request.rate_limit_class,
            created_at: Utc::now(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Heap entry: a work item plus its enqueue sequence number
///
/// Higher priority pops first; within a tier the lower sequence number
/// (earlier enqueue) pops first. A retry takes a fresh sequence number.
#[derive(Debug)]
pub struct QueuedItem {
    pub seq: u64,
    pub item: WorkItem,
}

impl Eq for QueuedItem {}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Why a work item ended in failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Failure {
    /// The callable returned an error (or panicked)
    Error(String),
    /// The attempt exceeded its timeout
    TimedOut(Duration),
    /// Admission never opened and the exhausted policy is `fail`
    RateLimitExhausted { class: String, waited: Duration },
    /// The scheduler stopped before the item was dispatched
    Stopped,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(message) => write!(f, "{}", message),
            Self::TimedOut(after) => write!(f, "timed out after {:?}", after),
            Self::RateLimitExhausted { class, waited } => {
                write!(f, "rate limit '{}' exhausted after {:?}", class, waited)
            }
            Self::Stopped => write!(f, "scheduler stopped before dispatch"),
        }
    }
}

/// Terminal outcome of a work item, written exactly once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestResult {
    pub request_id: String,
    pub success: bool,
    pub value: Option<Value>,
    pub failure: Option<Failure>,
    /// Duration of the final attempt
    pub duration: Duration,
    pub retry_count: u32,
}

impl RequestResult {
    pub fn succeeded(request_id: impl Into<String>, value: Value, duration: Duration, retry_count: u32) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            value: Some(value),
            failure: None,
            duration,
            retry_count,
        }
    }

    pub fn failed(request_id: impl Into<String>, failure: Failure, duration: Duration, retry_count: u32) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            value: None,
            failure: Some(failure),
            duration,
            retry_count,
        }
    }

    /// Convert into the value, or the matching error for a failed item
    pub fn into_result(self) -> Result<Value, SchedulerError> {
        if self.success {
            return Ok(self.value.unwrap_or(Value::Null));
        }
        match self.failure {
            Some(Failure::TimedOut(timeout)) => Err(SchedulerError::Timeout {
                request_id: self.request_id,
                timeout,
            }),
            Some(Failure::RateLimitExhausted { class, waited }) => {
                Err(SchedulerError::RateLimitExhausted { class, waited })
            }
            Some(Failure::Stopped) => Err(SchedulerError::Stopped),
            Some(Failure::Error(message)) => Err(SchedulerError::Execution {
                request_id: self.request_id,
                retry_count: self.retry_count,
                message,
            }),
            None => Err(SchedulerError::Execution {
                request_id: self.request_id,
                retry_count: self.retry_count,
                message: "unknown failure".to_string(),
            }),
        }
    }
}

/// Point-in-time scheduler counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_rejected: u64,
    pub rate_limit_waits: u64,
    /// Rolling mean of final-attempt durations, in milliseconds
    pub avg_duration_ms: f64,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub peak_queue_depth: usize,
}

impl SchedulerStats {
    /// Fold a terminal result into the counters
    pub fn record_result(&mut self, result: &RequestResult) {
        if result.success {
            self.total_succeeded += 1;
        } else {
            self.total_failed += 1;
        }
        let completed = (self.total_succeeded + self.total_failed) as f64;
        let sample = result.duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms += (sample - self.avg_duration_ms) / completed;
    }
}
