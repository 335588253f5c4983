//! Bounded retry with exponential backoff for model calls.

use std::time::Duration;

use crate::client::ModelResult;

/// Retry schedule for a model call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before attempt number `attempt` (1-based; attempt 1 never waits).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 2);
        let scaled = (self.initial_backoff.as_nanos() as f64 * factor).round();
        let capped = scaled.min(self.max_backoff.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Returns the result and the attempts used.
    pub fn run<T, F>(&self, operation: &str, mut call: F) -> (ModelResult<T>, u32)
    where
        F: FnMut(u32) -> ModelResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let delay = self.backoff_for(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }

            match call(attempt) {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "model call failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
