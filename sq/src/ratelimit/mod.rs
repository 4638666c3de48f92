//! Rate-limit admission control
//!
//! Tracks per-class quota state fed back from live API responses and decides
//! whether new calls may be dispatched without external coordination.

mod config;
mod controller;
mod state;

pub use config::{AdmissionConfig, ExhaustedPolicy};
pub use controller::{AdmissionWait, RateLimitAdmissionController};
pub use state::{QuotaMetadata, RateLimitState};
