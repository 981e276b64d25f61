//! # Exponential Backoff
//!
//! Retry delays for failed reconciles. Each consecutive failure doubles the
//! delay, starting at the configured floor and capped at the ceiling:
//! 1s, 2s, 4s, ... 256s, 300s (max) with the default options.

use std::time::Duration;

/// Exponential backoff calculator
///
/// Tracks the number of consecutive failures for one key. The delay for the
/// n-th failure is `min * 2^(n-1)`, never more than `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    /// Failures seen since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given floor and ceiling
    ///
    /// # Arguments
    ///
    /// * `min` - Delay after the first failure
    /// * `max` - Ceiling for all later delays
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempts: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_error_count(self.attempts, self.min, self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Failures recorded since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay for a given number of previous errors (stateless)
    ///
    /// `error_count` 0 yields `min`, each further error doubles it, and the
    /// result is capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, min: Duration, max: Duration) -> Duration {
        // 2^31 already overflows any sensible floor; stop shifting before that.
        let factor = 1u32.checked_shl(error_count.min(31)).unwrap_or(u32::MAX);
        min.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}
