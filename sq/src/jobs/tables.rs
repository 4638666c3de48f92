//! Live job maps, bounded history, and the stats derived from them

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::job::{JobStatus, ScanJob};

/// A job that has not finished yet, with its cancellation flag
pub(crate) struct ActiveJob {
    pub job: ScanJob,
    pub cancel: watch::Sender<bool>,
}

impl ActiveJob {
    pub fn new(job: ScanJob) -> Self {
        let (cancel, _) = watch::channel(false);
        Self { job, cancel }
    }
}

/// Point-in-time job queue counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_jobs: u64,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    /// Mean duration of completed and failed jobs in history, in seconds
    pub avg_duration_secs: f64,
    /// History entries that finished within the trailing hour
    pub throughput_per_hour: usize,
}

/// Active jobs (queued or running), finished jobs, and the history ring
pub(crate) struct JobTables {
    pub active: HashMap<String, ActiveJob>,
    pub completed: HashMap<String, ScanJob>,
    pub history: VecDeque<ScanJob>,
    pub total_submitted: u64,
    capacity: usize,
}

impl JobTables {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            completed: HashMap::new(),
            history: VecDeque::with_capacity(capacity.min(1024)),
            total_submitted: 0,
            capacity: capacity.max(1),
        }
    }

    /// Most recent snapshot of a job: active, then completed, then history
    pub fn lookup(&self, job_id: &str) -> Option<ScanJob> {
        if let Some(active) = self.active.get(job_id) {
            return Some(active.job.clone());
        }
        if let Some(job) = self.completed.get(job_id) {
            return Some(job.clone());
        }
        self.history.iter().rev().find(|job| job.id == job_id).cloned()
    }

    /// Move a terminal job out of the active map into completed + history
    pub fn retire(&mut self, job: ScanJob) {
        debug!(job_id = %job.id, status = %job.status, "JobTables::retire: called");
        self.active.remove(&job.id);
        self.completed.insert(job.id.clone(), job.clone());
        self.history.push_back(job);

        while self.history.len() > self.capacity {
            if let Some(evicted) = self.history.pop_front() {
                debug!(job_id = %evicted.id, "JobTables::retire: evicting oldest history entry");
                self.completed.remove(&evicted.id);
            }
        }
    }

    pub fn running(&self) -> usize {
        self.active
            .values()
            .filter(|active| active.job.status == JobStatus::Running)
            .count()
    }

    pub fn stats(&self, queued: usize, now: DateTime<Utc>) -> QueueStats {
        let count = |status: JobStatus| self.history.iter().filter(|job| job.status == status).count();

        let durations: Vec<f64> = self
            .history
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Completed | JobStatus::Failed))
            .filter_map(|job| job.duration.map(|d| d.as_secs_f64()))
            .collect();
        let avg_duration_secs = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        let hour_ago = now - ChronoDuration::hours(1);
        let throughput_per_hour = self
            .history
            .iter()
            .filter(|job| job.completed_at.is_some_and(|t| t >= hour_ago))
            .count();

        QueueStats {
            total_jobs: self.total_submitted,
            queued_jobs: queued,
            running_jobs: self.running(),
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            cancelled_jobs: count(JobStatus::Cancelled),
            avg_duration_secs,
            throughput_per_hour,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use serde_json::Value;

    fn finished(status: JobStatus, secs: i64, ended_at: DateTime<Utc>) -> ScanJob {
        let mut job = ScanJob::new("scan", "u", "t", Value::Null, Priority::Normal);
        job.start(ended_at - ChronoDuration::seconds(secs));
        match status {
            JobStatus::Completed => job.finish(ended_at, Ok(Value::Null)),
            JobStatus::Failed => job.finish(ended_at, Err("boom".to_string())),
            _ => job.cancel(ended_at, None),
        };
        job
    }

    #[test]
    fn test_history_is_bounded() {
        let now = Utc::now();
        let mut tables = JobTables::new(3);
        let jobs: Vec<_> = (0..5).map(|_| finished(JobStatus::Completed, 1, now)).collect();
        for job in &jobs {
            tables.retire(job.clone());
        }

        assert_eq!(tables.history.len(), 3);
        assert_eq!(tables.completed.len(), 3);
        assert!(tables.lookup(&jobs[0].id).is_none());
        assert!(tables.lookup(&jobs[4].id).is_some());
    }

    #[test]
    fn test_lookup_prefers_active() {
        let mut tables = JobTables::new(10);
        let job = ScanJob::new("scan", "u", "t", Value::Null, Priority::High);
        tables.active.insert(job.id.clone(), ActiveJob::new(job.clone()));
        assert_eq!(tables.lookup(&job.id).unwrap().status, JobStatus::Queued);
        assert!(tables.lookup("missing").is_none());
    }

    #[test]
    fn test_stats_from_history() {
        let now = Utc::now();
        let mut tables = JobTables::new(10);
        tables.total_submitted = 5;
        tables.retire(finished(JobStatus::Completed, 2, now));
        tables.retire(finished(JobStatus::Completed, 4, now - ChronoDuration::hours(2)));
        tables.retire(finished(JobStatus::Failed, 6, now));
        tables.retire(finished(JobStatus::Cancelled, 100, now));

        let stats = tables.stats(1, now);
        assert_eq!(stats.total_jobs, 5);
        assert_eq!(stats.queued_jobs, 1);
        assert_eq!(stats.running_jobs, 0);
        assert_eq!(stats.completed_jobs, 2);
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.cancelled_jobs, 1);
        assert!((stats.avg_duration_secs - 4.0).abs() < 1e-9);
        assert_eq!(stats.throughput_per_hour, 3);
    }
}
