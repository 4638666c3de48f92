//! Admission controller configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a worker does when the admission wait ceiling elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Log a warning and dispatch anyway
    #[default]
    Proceed,
    /// Finalize the work item as failed without retrying
    Fail,
}

/// Rate-limit admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Remaining quota at or below which dispatch is held back
    #[serde(rename = "safety-buffer", default = "default_safety_buffer")]
    pub safety_buffer: u32,

    /// Dispatches allowed per trailing minute when no live quota is known
    #[serde(rename = "soft-cap-per-minute", default = "default_soft_cap")]
    pub soft_cap_per_minute: usize,

    /// Sleep between admission checks while waiting
    #[serde(rename = "check-interval-ms", default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Ceiling on a single admission wait
    #[serde(rename = "max-wait-secs", default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Behaviour once the wait ceiling elapses
    #[serde(rename = "on-exhausted", default)]
    pub on_exhausted: ExhaustedPolicy,

    /// Hourly limit for classes not listed in `classes`
    #[serde(rename = "default-limit", default = "default_limit")]
    pub default_limit: u32,

    /// Hourly limit per rate-limit class
    #[serde(default)]
    pub classes: HashMap<String, u32>,
}

fn default_safety_buffer() -> u32 {
    10
}

fn default_soft_cap() -> usize {
    30
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_max_wait_secs() -> u64 {
    300
}

fn default_limit() -> u32 {
    5000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            safety_buffer: default_safety_buffer(),
            soft_cap_per_minute: default_soft_cap(),
            check_interval_ms: default_check_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
            on_exhausted: ExhaustedPolicy::Proceed,
            default_limit: default_limit(),
            classes: HashMap::new(),
        }
    }
}

impl AdmissionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Hourly limit configured for a class
    pub fn limit_for(&self, class: &str) -> u32 {
        self.classes.get(class).copied().unwrap_or(self.default_limit)
    }
}
