//! Job handler contract and the context handed to running handlers

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::domain::Priority;
use crate::scheduler::RequestScheduler;

use super::job::ScanJob;
use super::tables::JobTables;

/// Runs one job type
///
/// Handlers report progress through the [`JobContext`] and return the job's
/// result, or an error to fail it. Plain async closures taking a
/// `JobContext` implement this trait too.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> eyre::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> eyre::Result<Value> {
        (self)(ctx).await
    }
}

/// A running job's view of itself and of the scheduler it fans out into
#[derive(Clone)]
pub struct JobContext {
    job: ScanJob,
    tables: Arc<Mutex<JobTables>>,
    cancelled: watch::Receiver<bool>,
    scheduler: Arc<RequestScheduler>,
}

impl JobContext {
    pub(crate) fn new(
        job: ScanJob,
        tables: Arc<Mutex<JobTables>>,
        cancelled: watch::Receiver<bool>,
        scheduler: Arc<RequestScheduler>,
    ) -> Self {
        Self {
            job,
            tables,
            cancelled,
            scheduler,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn user_id(&self) -> &str {
        &self.job.user_id
    }

    pub fn target(&self) -> &str {
        &self.job.target
    }

    pub fn params(&self) -> &Value {
        &self.job.params
    }

    pub fn priority(&self) -> Priority {
        self.job.priority
    }

    /// Scheduler for issuing the job's work items
    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    /// Update progress and phase label
    ///
    /// Progress never moves backwards and updates after the job has been
    /// cancelled are dropped.
    pub async fn set_progress(&self, progress: u8, phase: impl Into<String>) {
        let phase = phase.into();
        debug!(job_id = %self.job.id, progress, %phase, "JobContext::set_progress: called");
        let mut tables = self.tables.lock().await;
        if let Some(active) = tables.active.get_mut(&self.job.id) {
            active.job.update_progress(progress, phase);
        }
    }

    /// Whether the job has been cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the job is cancelled; pair with `tokio::select!` to stop early
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
