//! Admission gate consulted before a job starts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::ratelimit::RateLimitAdmissionController;

/// Decides whether the job queue may start another job right now
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn can_start_scan(&self) -> bool;
}

/// Default monitor: never holds a job back
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAvailable;

#[async_trait]
impl ResourceMonitor for AlwaysAvailable {
    async fn can_start_scan(&self) -> bool {
        true
    }
}

/// Holds jobs back while any watched rate-limit class is exhausted
///
/// The answer is cached so a burst of job starts does not hammer the
/// admission controller.
pub struct QuotaResourceMonitor {
    admission: Arc<RateLimitAdmissionController>,
    classes: Vec<String>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl QuotaResourceMonitor {
    pub fn new(admission: Arc<RateLimitAdmissionController>, classes: Vec<String>, ttl: Duration) -> Self {
        debug!(?classes, ?ttl, "QuotaResourceMonitor::new: called");
        Self {
            admission,
            classes,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ResourceMonitor for QuotaResourceMonitor {
    async fn can_start_scan(&self) -> bool {
        let mut cached = self.cached.lock().await;
        if let Some((checked_at, available)) = *cached
            && checked_at.elapsed() < self.ttl
        {
            return available;
        }

        let mut available = true;
        for class in &self.classes {
            if !self.admission.can_dispatch(class).await {
                debug!(%class, "QuotaResourceMonitor::can_start_scan: class exhausted");
                available = false;
                break;
            }
        }
        *cached = Some((Instant::now(), available));
        available
    }
}
