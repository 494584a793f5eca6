//! Reconnect retry policies.

use std::time::Duration;

/// Decides whether and when the connection manager retries a connect.
///
/// A policy is owned by exactly one connection manager and only touched by
/// its reconnect loop.
pub trait RetryPolicy: Send + 'static {
    /// Returns true and counts an attempt if the budget allows another one.
    fn should_retry(&mut self) -> bool;

    /// Delay to wait before the next attempt.
    fn next_retry_delay(&self) -> Duration;

    /// Restore the full attempt budget after a successful reconnect.
    fn reset(&mut self);
}

/// Fixed delay between a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct LinearRetryPolicy {
    max_attempts: u32,
    delay: Duration,
    attempts: u32,
}

impl LinearRetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for LinearRetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(10))
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn should_retry(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    fn next_retry_delay(&self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}
