//! Per-class quota state

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::AdmissionConfig;

/// Length of the rolling dispatch log in seconds
const LOG_WINDOW_SECS: i64 = 3600;

/// Window for the soft per-minute cap in seconds
const SOFT_WINDOW_SECS: i64 = 60;

/// Quota metadata reported by a live API response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaMetadata {
    /// Calls left in the current quota window
    pub remaining: Option<u32>,
    /// When the quota window resets
    pub reset_at: Option<DateTime<Utc>>,
    /// Size of the quota window, if the API reports it
    pub limit: Option<u32>,
}

impl QuotaMetadata {
    /// Build from the usual `remaining` + `reset` (epoch seconds) header pair
    pub fn new(remaining: u32, reset_epoch_secs: i64) -> Self {
        Self {
            remaining: Some(remaining),
            reset_at: DateTime::from_timestamp(reset_epoch_secs, 0),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Quota bookkeeping for one rate-limit class
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitState {
    /// Configured (or reported) hourly limit
    pub limit: u32,
    /// Last known remaining quota
    pub remaining: Option<u32>,
    /// Last known reset time
    pub reset_at: Option<DateTime<Utc>>,
    /// Dispatch timestamps within the trailing hour, oldest first
    dispatches: VecDeque<DateTime<Utc>>,
}

impl RateLimitState {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            remaining: None,
            reset_at: None,
            dispatches: VecDeque::new(),
        }
    }

    /// Drop dispatch timestamps older than the log window
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::seconds(LOG_WINDOW_SECS);
        while self.dispatches.front().is_some_and(|t| *t < cutoff) {
            self.dispatches.pop_front();
        }
    }

    /// Append a dispatch and fold in any live quota values
    pub fn record(&mut self, now: DateTime<Utc>, metadata: Option<&QuotaMetadata>) {
        self.dispatches.push_back(now);
        self.prune(now);

        if let Some(meta) = metadata {
            debug!(?meta, "RateLimitState::record: applying live quota");
            if let Some(remaining) = meta.remaining {
                self.remaining = Some(remaining);
            }
            if let Some(reset_at) = meta.reset_at {
                self.reset_at = Some(reset_at);
            }
            if let Some(limit) = meta.limit {
                self.limit = limit;
            }
        }
    }

    /// Dispatches recorded within `window` of `now`
    pub fn dispatches_within(&self, now: DateTime<Utc>, window: ChronoDuration) -> usize {
        let cutoff = now - window;
        self.dispatches.iter().rev().take_while(|t| **t >= cutoff).count()
    }

    /// Decide whether a dispatch may go ahead now
    ///
    /// Live quota is authoritative while its reset time is in the future; once
    /// the reset passes the cached values are cleared. Without live quota the
    /// hourly limit and the per-minute soft cap apply.
    pub fn admits(&mut self, now: DateTime<Utc>, config: &AdmissionConfig) -> bool {
        if self.reset_at.is_some_and(|reset| now >= reset) {
            debug!("RateLimitState::admits: reset time passed, clearing cached quota");
            self.remaining = None;
            self.reset_at = None;
            return true;
        }

        if let Some(remaining) = self.remaining {
            if remaining > config.safety_buffer {
                return true;
            }
            if self.reset_at.is_some() {
                debug!(remaining, "RateLimitState::admits: quota at safety buffer, holding until reset");
                return false;
            }
        }

        self.prune(now);
        if self.dispatches.len() >= self.limit as usize {
            debug!(limit = self.limit, "RateLimitState::admits: hourly limit reached");
            return false;
        }
        self.dispatches_within(now, ChronoDuration::seconds(SOFT_WINDOW_SECS)) < config.soft_cap_per_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_prune_drops_entries_older_than_an_hour() {
        let mut state = RateLimitState::new(100);
        state.record(t0(), None);
        state.record(t0() + ChronoDuration::minutes(30), None);
        state.prune(t0() + ChronoDuration::minutes(61));
        assert_eq!(state.dispatches_within(t0() + ChronoDuration::minutes(61), ChronoDuration::hours(1)), 1);
    }

    #[test]
    fn test_metadata_overwrites_cache() {
        let mut state = RateLimitState::new(100);
        state.record(t0(), Some(&QuotaMetadata::new(42, 1_700_000_600).with_limit(60)));
        assert_eq!(state.remaining, Some(42));
        assert_eq!(state.reset_at, DateTime::from_timestamp(1_700_000_600, 0));
        assert_eq!(state.limit, 60);

        state.record(t0(), Some(&QuotaMetadata::new(41, 1_700_000_600)));
        assert_eq!(state.remaining, Some(41));
    }

    #[test]
    fn test_soft_cap_without_metadata() {
        let config = AdmissionConfig {
            soft_cap_per_minute: 3,
            ..Default::default()
        };
        let mut state = RateLimitState::new(100);
        for _ in 0..3 {
            assert!(state.admits(t0(), &config));
            state.record(t0(), None);
        }
        assert!(!state.admits(t0(), &config));
        assert!(state.admits(t0() + ChronoDuration::seconds(61), &config));
    }

    #[test]
    fn test_hourly_limit_without_metadata() {
        let config = AdmissionConfig::default();
        let mut state = RateLimitState::new(2);
        state.record(t0(), None);
        state.record(t0() + ChronoDuration::minutes(5), None);
        assert!(!state.admits(t0() + ChronoDuration::minutes(10), &config));
        assert!(state.admits(t0() + ChronoDuration::minutes(61), &config));
    }

    #[test]
    fn test_low_remaining_without_reset_falls_back_to_window() {
        let config = AdmissionConfig::default();
        let mut state = RateLimitState::new(100);
        state.record(
            t0(),
            Some(&QuotaMetadata {
                remaining: Some(1),
                ..Default::default()
            }),
        );
        assert!(state.admits(t0(), &config));
    }
}
