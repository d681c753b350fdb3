// src/recovery/backoff.rs
// Exponential backoff schedule for retried operations

use std::time::Duration;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Upper bound applied to server-supplied retry-after hints
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `min(base * multiplier^retry, max)` for the retry following failure
    /// number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let exp = base_ms * self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let capped = if exp.is_finite() { exp.min(max_ms) } else { max_ms };
        Duration::from_nanos((capped.max(0.0) * 1_000_000.0).round() as u64)
    }

    /// Delay before the next attempt, preferring a rate-limit hint
    pub fn delay_after(&self, error: &CoreError, retry: u32) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_retry_after),
            None => self.delay_for(retry),
        }
    }

    /// Whole schedule for `max_attempts`, one delay per retry
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|i| self.delay_for(i))
            .collect()
    }
}
