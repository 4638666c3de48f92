//! JobQueueManager - schedules composite jobs on a small worker pool
//!
//! The JobQueueManager is responsible for:
//! - Queueing jobs by priority, independently of the request queue
//! - Running at most `max_concurrent_jobs` handlers at once
//! - Consulting the resource monitor before each start
//! - Tracking lifecycle, progress, and a bounded history for stats

use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::Priority;
use crate::error::SchedulerError;
use crate::scheduler::RequestScheduler;

use super::config::JobQueueConfig;
use super::handler::{JobContext, JobHandler};
use super::job::{JobStatus, ScanJob};
use super::resource::{AlwaysAvailable, ResourceMonitor};
use super::tables::{ActiveJob, JobTables, QueueStats};

/// Heap entry for a queued job
#[derive(Debug, Clone)]
struct QueuedJob {
    priority: Priority,
    seq: u64,
    job_id: String,
}

impl Eq for QueuedJob {}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier submission
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

/// Priority queue and worker pool for composite jobs
pub struct JobQueueManager {
    config: JobQueueConfig,
    scheduler: Arc<RequestScheduler>,
    monitor: Arc<dyn ResourceMonitor>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    queue: Mutex<JobQueue>,
    tables: Arc<Mutex<JobTables>>,
    notify: Notify,
    finished: Notify,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueueManager {
    /// Create a manager that never holds jobs back for resources
    pub fn new(config: JobQueueConfig, scheduler: Arc<RequestScheduler>) -> Self {
        Self::with_monitor(config, scheduler, Arc::new(AlwaysAvailable))
    }

    pub fn with_monitor(
        config: JobQueueConfig,
        scheduler: Arc<RequestScheduler>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        debug!(?config, "JobQueueManager::new: called");
        let (shutdown, _) = watch::channel(false);
        Self {
            tables: Arc::new(Mutex::new(JobTables::new(config.history_capacity))),
            config,
            scheduler,
            monitor,
            handlers: RwLock::new(HashMap::new()),
            queue: Mutex::new(JobQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            finished: Notify::new(),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    /// Register the handler for a job type, replacing any previous one
    pub async fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        debug!(%job_type, "JobQueueManager::register_handler: called");
        self.handlers.write().await.insert(job_type, Arc::new(handler));
    }

    /// Queue a job and return its id
    pub async fn submit_job(
        &self,
        job_type: &str,
        user_id: &str,
        target: &str,
        params: Value,
        priority: Priority,
    ) -> Result<String, SchedulerError> {
        debug!(%job_type, %user_id, %target, %priority, "JobQueueManager::submit_job: called");
        let mut queue = self.queue.lock().await;
        if queue.heap.len() >= self.config.max_queue_size {
            debug!("JobQueueManager::submit_job: queue full, rejecting");
            return Err(SchedulerError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let job = ScanJob::new(job_type, user_id, target, params, priority);
        let job_id = job.id.clone();
        {
            let mut tables = self.tables.lock().await;
            tables.total_submitted += 1;
            tables.active.insert(job_id.clone(), ActiveJob::new(job));
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedJob {
            priority,
            seq,
            job_id: job_id.clone(),
        });
        drop(queue);

        info!(%job_id, %job_type, %target, "Job queued");
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Cancel a queued or running job
    ///
    /// Returns false when the job is unknown or already terminal. A running
    /// handler is not interrupted; it sees the flag through its context.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        debug!(%job_id, "JobQueueManager::cancel_job: called");
        let mut queue = self.queue.lock().await;
        let mut tables = self.tables.lock().await;

        let Some(active) = tables.active.get_mut(job_id) else {
            debug!(%job_id, "JobQueueManager::cancel_job: not active");
            return false;
        };
        let was_queued = active.job.status == JobStatus::Queued;
        if !active.job.cancel(Utc::now(), None) {
            return false;
        }
        active.cancel.send_replace(true);

        if was_queued {
            debug!(%job_id, "JobQueueManager::cancel_job: removing from queue");
            let remaining: Vec<_> = queue.heap.drain().filter(|q| q.job_id != job_id).collect();
            queue.heap = remaining.into_iter().collect();
            if let Some(active) = tables.active.remove(job_id) {
                tables.retire(active.job);
            }
            drop(tables);
            self.finished.notify_waiters();
        }

        info!(%job_id, was_queued, "Job cancelled");
        true
    }

    /// Latest known snapshot of a job, or None if it was never submitted
    pub async fn get_job_status(&self, job_id: &str) -> Option<ScanJob> {
        self.tables.lock().await.lookup(job_id)
    }

    /// Like [`get_job_status`](Self::get_job_status) but unknown ids are an error
    pub async fn job(&self, job_id: &str) -> Result<ScanJob, SchedulerError> {
        self.get_job_status(job_id)
            .await
            .ok_or_else(|| SchedulerError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Wait until a job reaches a terminal state
    pub async fn await_job(&self, job_id: &str, timeout: Option<Duration>) -> Result<ScanJob, SchedulerError> {
        debug!(%job_id, ?timeout, "JobQueueManager::await_job: called");
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(SchedulerError::Timeout {
                            request_id: job_id.to_string(),
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Counters recomputed from the live maps and history
    pub async fn get_queue_stats(&self) -> QueueStats {
        let queued = self.queue.lock().await.heap.len();
        self.tables.lock().await.stats(queued, Utc::now())
    }

    pub async fn is_running(&self) -> bool {
        !self.workers.lock().await.is_empty()
    }

    /// Spawn the job workers; a no-op when already running
    pub async fn start(self: &Arc<Self>) {
        debug!("JobQueueManager::start: called");
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            debug!("JobQueueManager::start: already running");
            return;
        }

        self.shutdown.send_replace(false);
        for worker_id in 0..self.config.max_concurrent_jobs {
            let shutdown_rx = self.shutdown.subscribe();
            workers.push(tokio::spawn(Arc::clone(self).worker_loop(worker_id, shutdown_rx)));
        }
        info!(workers = workers.len(), "JobQueueManager started");
    }

    /// Stop the workers and cancel every job that has not finished
    pub async fn stop(&self) {
        debug!("JobQueueManager::stop: called");
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        if handles.is_empty() {
            debug!("JobQueueManager::stop: not running");
            return;
        }

        self.shutdown.send_replace(true);
        for mut handle in handles {
            if tokio::time::timeout(self.config.shutdown_timeout(), &mut handle)
                .await
                .is_err()
            {
                warn!("Job worker did not stop in time, aborting");
                handle.abort();
            }
        }

        let mut queue = self.queue.lock().await;
        queue.heap.clear();
        let mut tables = self.tables.lock().await;
        let unfinished: Vec<String> = tables.active.keys().cloned().collect();
        let mut cancelled = 0;
        for job_id in &unfinished {
            if let Some(mut active) = tables.active.remove(job_id) {
                // Running jobs cancelled earlier are still waiting on their handler
                if !active.job.status.is_terminal() {
                    active.job.cancel(Utc::now(), Some("job queue stopped".to_string()));
                    cancelled += 1;
                }
                active.cancel.send_replace(true);
                tables.retire(active.job);
            }
        }
        drop(tables);
        drop(queue);

        self.finished.notify_waiters();
        info!(cancelled, "JobQueueManager stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "JobQueueManager::worker_loop: started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(worker_id, "JobQueueManager::worker_loop: shutdown observed");
                    break;
                }
                _ = self.work_once(worker_id) => {}
            }
        }
        debug!(worker_id, "JobQueueManager::worker_loop: exited");
    }

    async fn work_once(&self, worker_id: usize) {
        let Some(queued) = self.next_job().await else {
            return;
        };

        if !self.monitor.can_start_scan().await {
            debug!(worker_id, job_id = %queued.job_id, "JobQueueManager::work_once: resources unavailable, deferring");
            tokio::time::sleep(self.config.resource_retry_delay()).await;
            self.queue.lock().await.heap.push(queued);
            self.notify.notify_one();
            return;
        }

        let Some(ctx) = self.begin(&queued.job_id).await else {
            debug!(worker_id, job_id = %queued.job_id, "JobQueueManager::work_once: job no longer queued, skipping");
            return;
        };
        self.run_job(worker_id, ctx).await;
    }

    async fn next_job(&self) -> Option<QueuedJob> {
        let notified = self.notify.notified();
        if let Some(queued) = self.queue.lock().await.heap.pop() {
            return Some(queued);
        }
        let _ = tokio::time::timeout(self.config.poll_interval(), notified).await;
        None
    }

    /// QUEUED -> RUNNING, returning the handler's context
    async fn begin(&self, job_id: &str) -> Option<JobContext> {
        let mut tables = self.tables.lock().await;
        let active = tables.active.get_mut(job_id)?;
        if !active.job.start(Utc::now()) {
            return None;
        }
        Some(JobContext::new(
            active.job.clone(),
            Arc::clone(&self.tables),
            active.cancel.subscribe(),
            Arc::clone(&self.scheduler),
        ))
    }

    async fn run_job(&self, worker_id: usize, ctx: JobContext) {
        let job_id = ctx.job_id().to_string();
        let job_type = ctx.job_type().to_string();
        info!(worker_id, %job_id, %job_type, "Job started");

        let handler = self.handlers.read().await.get(&job_type).cloned();
        let outcome = match handler {
            Some(handler) => {
                let run = AssertUnwindSafe(handler.run(ctx)).catch_unwind();
                let caught = match self.config.job_timeout() {
                    Some(limit) => match tokio::time::timeout(limit, run).await {
                        Ok(caught) => caught,
                        Err(_) => Ok(Err(eyre::eyre!("job timed out after {:?}", limit))),
                    },
                    None => run.await,
                };
                match caught {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err("job handler panicked".to_string()),
                }
            }
            None => Err(format!("no handler registered for job type '{}'", job_type)),
        };

        self.complete(&job_id, outcome).await;
    }

    /// Record the handler outcome and retire the job
    async fn complete(&self, job_id: &str, outcome: Result<Value, String>) {
        let mut tables = self.tables.lock().await;
        let Some(mut active) = tables.active.remove(job_id) else {
            debug!(%job_id, "JobQueueManager::complete: job already retired");
            return;
        };

        if active.job.status == JobStatus::Cancelled {
            debug!(%job_id, "JobQueueManager::complete: job was cancelled, discarding outcome");
        } else if let Err(message) = &outcome {
            warn!(%job_id, error = %message, "Job failed");
            active.job.finish(Utc::now(), outcome);
        } else {
            active.job.finish(Utc::now(), outcome);
            info!(%job_id, duration = ?active.job.duration, "Job completed");
        }

        tables.retire(active.job);
        drop(tables);
        self.finished.notify_waiters();
    }
}
