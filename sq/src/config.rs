//! ScanQueue configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::jobs::JobQueueConfig;
use crate::ratelimit::AdmissionConfig;
use crate::scheduler::SchedulerConfig;

/// Main ScanQueue configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error); RUST_LOG still applies
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Request scheduler
    pub scheduler: SchedulerConfig,

    /// Rate-limit admission control
    pub admission: AdmissionConfig,

    /// Job queue
    pub jobs: JobQueueConfig,
}

impl Config {
    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_requests == 0 {
            return Err(eyre::eyre!("scheduler.max-concurrent-requests must be at least 1"));
        }
        if self.scheduler.max_queue_size == 0 {
            return Err(eyre::eyre!("scheduler.max-queue-size must be at least 1"));
        }
        if self.scheduler.blocking_threads == 0 {
            return Err(eyre::eyre!("scheduler.blocking-threads must be at least 1"));
        }
        if self.jobs.max_concurrent_jobs == 0 {
            return Err(eyre::eyre!("jobs.max-concurrent-jobs must be at least 1"));
        }
        if self.scheduler.backoff_cap_ms < self.scheduler.backoff_base_ms {
            return Err(eyre::eyre!(
                "scheduler.backoff-cap-ms ({}) is below backoff-base-ms ({})",
                self.scheduler.backoff_cap_ms,
                self.scheduler.backoff_base_ms
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .scanqueue.yml
        let local_config = PathBuf::from(".scanqueue.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/scanqueue/scanqueue.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("scanqueue").join("scanqueue.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
