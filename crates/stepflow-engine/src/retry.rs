use std::time::Duration;

use stepflow_core::types::RetryPolicy;

/// Delay before retry number `retry_index` (0-based):
/// `base_delay_ms * multiplier^retry_index`, capped at `max_backoff_ms`.
///
/// With `jitter` the capped delay is scaled by a random 0.8x to 1.2x.
pub fn backoff_delay(policy: &RetryPolicy, retry_index: u32, jitter: bool, max_backoff_ms: u64) -> Duration {
    let exp = i32::try_from(retry_index).unwrap_or(i32::MAX);
    let raw = policy.base_delay_ms as f64 * policy.multiplier.powi(exp);
    let ms = if raw.is_finite() {
        raw.min(max_backoff_ms as f64)
    } else {
        max_backoff_ms as f64
    };

    let ms = if jitter {
        ms * (0.8 + rand::random::<f64>() * 0.4)
    } else {
        ms
    };
    Duration::from_millis(ms.round() as u64)
}

/// Whether a failed attempt may be followed by another.
pub fn has_attempts_left(policy: &RetryPolicy, attempts_made: u32) -> bool {
    attempts_made < policy.max_attempts
}
