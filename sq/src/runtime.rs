//! Runtime - owns the admission controller, scheduler, and job queue
//!
//! Services are built from one [`Config`] and brought up in dependency
//! order: the scheduler starts before the job queue that feeds it, and the
//! job queue stops before the scheduler.

use std::sync::Arc;

use eyre::Result;
use tracing::{debug, info};

use crate::config::Config;
use crate::jobs::{AlwaysAvailable, JobQueueManager, QuotaResourceMonitor, ResourceMonitor};
use crate::ratelimit::RateLimitAdmissionController;
use crate::scheduler::RequestScheduler;

pub struct Runtime {
    admission: Arc<RateLimitAdmissionController>,
    scheduler: Arc<RequestScheduler>,
    jobs: Arc<JobQueueManager>,
}

impl Runtime {
    /// Build every service from config without starting any workers
    ///
    /// When the config names rate-limit classes, jobs are held back while
    /// any of them is exhausted; otherwise jobs always start.
    pub fn from_config(config: &Config) -> Result<Self> {
        debug!("Runtime::from_config: called");
        config.validate()?;

        let admission = Arc::new(RateLimitAdmissionController::new(config.admission.clone()));
        let scheduler = Arc::new(RequestScheduler::new(config.scheduler.clone(), Arc::clone(&admission)));

        let mut classes: Vec<String> = config.admission.classes.keys().cloned().collect();
        classes.sort();
        let monitor: Arc<dyn ResourceMonitor> = if classes.is_empty() {
            debug!("Runtime::from_config: no rate-limit classes, jobs always start");
            Arc::new(AlwaysAvailable)
        } else {
            debug!(?classes, "Runtime::from_config: gating jobs on quota");
            Arc::new(QuotaResourceMonitor::new(
                Arc::clone(&admission),
                classes,
                config.jobs.resource_cache(),
            ))
        };
        let jobs = Arc::new(JobQueueManager::with_monitor(
            config.jobs.clone(),
            Arc::clone(&scheduler),
            monitor,
        ));

        Ok(Self {
            admission,
            scheduler,
            jobs,
        })
    }

    pub fn admission(&self) -> &Arc<RateLimitAdmissionController> {
        &self.admission
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    pub fn jobs(&self) -> &Arc<JobQueueManager> {
        &self.jobs
    }

    pub async fn start(&self) {
        debug!("Runtime::start: called");
        self.scheduler.start().await;
        self.jobs.start().await;
        info!("Runtime started");
    }

    pub async fn stop(&self) {
        debug!("Runtime::stop: called");
        self.jobs.stop().await;
        self.scheduler.stop().await;
        info!("Runtime stopped");
    }
}
