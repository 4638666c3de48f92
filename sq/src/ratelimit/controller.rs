//! RateLimitAdmissionController - gates dispatch against per-class quota

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

use super::config::{AdmissionConfig, ExhaustedPolicy};
use super::state::{QuotaMetadata, RateLimitState};

/// Outcome of waiting for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionWait {
    /// Time spent waiting
    pub waited: Duration,
    /// Whether the class admitted dispatch before the ceiling elapsed
    pub admitted: bool,
}

/// Tracks quota per rate-limit class and decides whether a call may proceed.
///
/// All class state lives behind one mutex so concurrent workers never lose
/// updates to the dispatch log or the cached quota values.
pub struct RateLimitAdmissionController {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    classes: Mutex<HashMap<String, RateLimitState>>,
}

impl RateLimitAdmissionController {
    /// Create a controller on the system clock
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a controller on a caller-supplied clock
    pub fn with_clock(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        debug!(?config, "RateLimitAdmissionController::new: called");
        Self {
            config,
            clock,
            classes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn exhausted_policy(&self) -> ExhaustedPolicy {
        self.config.on_exhausted
    }

    /// Whether a call in `class` may be dispatched now
    ///
    /// Classes that have never been recorded are always admitted.
    pub async fn can_dispatch(&self, class: &str) -> bool {
        let now = self.clock.now();
        let mut classes = self.classes.lock().await;
        match classes.get_mut(class) {
            Some(state) => {
                let admitted = state.admits(now, &self.config);
                debug!(%class, admitted, "RateLimitAdmissionController::can_dispatch: decided");
                admitted
            }
            None => {
                debug!(%class, "RateLimitAdmissionController::can_dispatch: unknown class, allowing");
                true
            }
        }
    }

    /// Record a dispatch for `class`, folding in live quota metadata if present
    pub async fn record(&self, class: &str, metadata: Option<&QuotaMetadata>) {
        debug!(%class, has_metadata = metadata.is_some(), "RateLimitAdmissionController::record: called");
        let now = self.clock.now();
        let mut classes = self.classes.lock().await;
        classes
            .entry(class.to_string())
            .or_insert_with(|| RateLimitState::new(self.config.limit_for(class)))
            .record(now, metadata);
    }

    /// Sleep in short steps until `class` admits dispatch or the ceiling elapses
    ///
    /// The caller decides what to do when `admitted` comes back false.
    pub async fn wait_until_allowed(&self, class: &str) -> AdmissionWait {
        let step = self.config.check_interval();
        let ceiling = self.config.max_wait();
        let mut waited = Duration::ZERO;

        loop {
            if self.can_dispatch(class).await {
                if !waited.is_zero() {
                    debug!(%class, ?waited, "RateLimitAdmissionController::wait_until_allowed: admitted after wait");
                }
                return AdmissionWait { waited, admitted: true };
            }
            if waited >= ceiling {
                warn!(%class, ?waited, "Rate limit wait ceiling reached");
                return AdmissionWait {
                    waited,
                    admitted: false,
                };
            }
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    /// Point-in-time copy of a class's state
    pub async fn snapshot(&self, class: &str) -> Option<RateLimitState> {
        self.classes.lock().await.get(class).cloned()
    }

    /// Names of all classes seen so far
    pub async fn known_classes(&self) -> Vec<String> {
        let mut names: Vec<_> = self.classes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
