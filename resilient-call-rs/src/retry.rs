//! # Retry Policy
//!
//! Exponential backoff with optional jitter. Pure computation: nothing here
//! knows about breaker state or recorded calls.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;
use crate::types::Error;

/// Upper bound for any computed delay (largest signed 32-bit millisecond
/// timer value).
pub const MAX_SAFE_DELAY_MS: u64 = i32::MAX as u64;

/// Delay before retrying after attempt `attempt` (1-indexed), without jitter.
///
/// `min(base * multiplier^(attempt-1), max_delay)`, clamped to
/// `[0, MAX_SAFE_DELAY_MS]`.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = (attempt.max(1) - 1).min(1_024) as i32;
    let raw = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(policy.max_delay_ms as f64)
    } else {
        policy.max_delay_ms as f64
    };

    Duration::from_millis(clamp_ms(capped))
}

/// Delay before retrying after attempt `attempt`, jittered when the policy asks for it
pub fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    compute_delay_with(attempt, policy, &mut rand::thread_rng())
}

/// [`compute_delay`] with a caller-supplied random source
pub fn compute_delay_with<R: Rng>(attempt: u32, policy: &RetryPolicy, rng: &mut R) -> Duration {
    let delay = backoff_delay(attempt, policy);
    if !policy.jitter {
        return delay;
    }

    let factor: f64 = rng.gen_range(0.5..=1.0);
    Duration::from_millis(clamp_ms(delay.as_millis() as f64 * factor))
}

/// Whether a failure on attempt `attempt` (1-indexed) may be followed by another attempt
pub fn should_retry(error: &Error, attempt: u32, policy: &RetryPolicy) -> bool {
    error.is_retryable() && attempt <= policy.max_retries
}

fn clamp_ms(ms: f64) -> u64 {
    if ms.is_nan() || ms <= 0.0 {
        0
    } else if ms >= MAX_SAFE_DELAY_MS as f64 {
        MAX_SAFE_DELAY_MS
    } else {
        ms as u64
    }
}
