//! Units of work accepted by the scheduler
//!
//! Async and blocking callables sit behind one [`Work`] type. The scheduler
//! decides how to run each variant; callers only see a value or an error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::domain::Priority;
use crate::ratelimit::QuotaMetadata;

/// What a callable returns: a value or an error to be retried
pub type WorkResult = eyre::Result<WorkOutput>;

type AsyncFn = dyn Fn() -> BoxFuture<'static, WorkResult> + Send + Sync;
type BlockingFn = dyn Fn() -> WorkResult + Send + Sync;

/// Successful output of a callable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkOutput {
    pub value: Value,
    /// Live quota reported by the remote API, fed back into admission control
    pub quota: Option<QuotaMetadata>,
}

impl WorkOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            quota: None,
        }
    }

    pub fn with_quota(mut self, quota: QuotaMetadata) -> Self {
        self.quota = Some(quota);
        self
    }
}

impl From<Value> for WorkOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// A re-invocable callable; each retry calls it again
#[derive(Clone)]
pub enum Work {
    /// Runs as a task on the async runtime
    Async(Arc<AsyncFn>),
    /// Offloaded to the bounded blocking executor
    Blocking(Arc<BlockingFn>),
}

impl Work {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        Work::Async(Arc::new(move || f().boxed()))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> WorkResult + Send + Sync + 'static,
    {
        Work::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Work::Blocking(_))
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Async(_) => f.write_str("Work::Async"),
            Work::Blocking(_) => f.write_str("Work::Blocking"),
        }
    }
}

/// Submission for [`RequestScheduler::submit`](super::RequestScheduler::submit)
///
/// Unset fields take the scheduler's configured defaults.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub id: String,
    pub work: Work,
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub rate_limit_class: Option<String>,
}

impl WorkRequest {
    pub fn new(id: impl Into<String>, work: Work) -> Self {
        Self {
            id: id.into(),
            work,
            priority: None,
            timeout: None,
            max_retries: None,
            rate_limit_class: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn rate_limit_class(mut self, class: impl Into<String>) -> Self {
        self.rate_limit_class = Some(class.into());
        self
    }
}
