//! Retry backoff

use std::time::Duration;

/// Delay before retry number `retry_count` (1-based): `base * 2^retry_count`, capped
pub fn backoff_delay(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
