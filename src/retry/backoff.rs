//! Backoff scheduler
//!
//! `delay(n) = min(base * multiplier^(n-1), max_delay)` for the `n`-th failed
//! attempt. No jitter: the same inputs always give the same delay.

use std::time::Duration;

use super::RetryPolicy;
use crate::error::{Error, Result};

/// Computes the delay before the next retry
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffScheduler;

impl BackoffScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Delay after failed attempt `attempt_count` (1-based)
    pub fn next_delay(&self, attempt_count: u32, policy: &RetryPolicy) -> Result<Duration> {
        if attempt_count == 0 {
            return Err(Error::invalid_argument(
                "attempt_count must be at least 1 to compute a backoff delay",
            ));
        }

        let cap = policy.backoff_max_delay();
        let exponent = (attempt_count - 1).min(i32::MAX as u32) as i32;
        let factor = policy.backoff_multiplier().powi(exponent);
        let secs = policy.backoff_base().as_secs_f64() * factor;

        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return Ok(cap);
        }

        Ok(Duration::from_secs_f64(secs).min(cap))
    }
}
