//! Scheduler and job queue error types

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the request scheduler and the job queue
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: String, timeout: Duration },

    #[error("Request {request_id} failed after {retry_count} retries: {message}")]
    Execution {
        request_id: String,
        retry_count: u32,
        message: String,
    },

    #[error("Rate limit for class '{class}' still exhausted after waiting {waited:?}")]
    RateLimitExhausted { class: String, waited: Duration },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Request {request_id} is already pending")]
    DuplicateRequest { request_id: String },

    #[error("Scheduler stopped before the request finished")]
    Stopped,
}

impl SchedulerError {
    /// Check if this is a deadline error (work item or caller wait)
    pub fn is_timeout(&self) -> bool {
        matches!(self, SchedulerError::Timeout { .. })
    }

    /// Check if the error was raised synchronously at submission time
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SchedulerError::QueueFull { .. } | SchedulerError::DuplicateRequest { .. }
        )
    }
}
