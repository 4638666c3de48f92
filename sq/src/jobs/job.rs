//! ScanJob and its lifecycle

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::Priority;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A composite, multi-phase operation run by the job queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: String,
    pub job_type: String,
    pub user_id: String,
    pub target: String,
    pub params: Value,
    pub priority: Priority,
    pub status: JobStatus,
    /// Percent complete, 0-100, never decreasing
    pub progress: u8,
    pub current_phase: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration: Option<Duration>,
}

impl ScanJob {
    pub fn new(
        job_type: impl Into<String>,
        user_id: impl Into<String>,
        target: impl Into<String>,
        params: Value,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            user_id: user_id.into(),
            target: target.into(),
            params,
            priority,
            status: JobStatus::Queued,
            progress: 0,
            current_phase: "queued".to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            duration: None,
        }
    }

    /// Apply a status change, rejecting anything the state machine forbids
    fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(job_id = %self.id, from = %self.status, to = %next, "Ignoring invalid job transition");
            return false;
        }
        debug!(job_id = %self.id, from = %self.status, to = %next, "ScanJob::transition: applied");
        self.status = next;
        true
    }

    /// QUEUED -> RUNNING
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(JobStatus::Running) {
            return false;
        }
        self.started_at = Some(now);
        self.current_phase = "starting".to_string();
        true
    }

    /// RUNNING -> COMPLETED / FAILED
    pub fn finish(&mut self, now: DateTime<Utc>, outcome: Result<Value, String>) -> bool {
        let next = if outcome.is_ok() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if !self.transition(next) {
            return false;
        }
        match outcome {
            Ok(value) => {
                self.result = Some(value);
                self.progress = 100;
                self.current_phase = "completed".to_string();
            }
            Err(message) => {
                self.error = Some(message);
                self.current_phase = "failed".to_string();
            }
        }
        self.close(now);
        true
    }

    /// QUEUED / RUNNING -> CANCELLED
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: Option<String>) -> bool {
        if !self.transition(JobStatus::Cancelled) {
            return false;
        }
        self.current_phase = "cancelled".to_string();
        self.error = reason;
        self.close(now);
        true
    }

    fn close(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration = self.started_at.and_then(|started| (now - started).to_std().ok());
    }

    /// Record handler progress; ignored once terminal and never moves backwards
    pub fn update_progress(&mut self, progress: u8, phase: impl Into<String>) {
        if self.status != JobStatus::Running {
            debug!(job_id = %self.id, status = %self.status, "ScanJob::update_progress: not running, ignoring");
            return;
        }
        self.progress = self.progress.max(progress.min(100));
        self.current_phase = phase.into();
    }
}
