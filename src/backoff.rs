//! Bounded exponential backoff for transient connect failures.

use std::time::Duration;

/// Retry schedule for the database connect.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
    /// Multiplier applied after each retry
    pub multiplier: f64,
    /// Maximum number of retries (None = unbounded)
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            max_attempts: Some(3),
        }
    }
}

/// Exponential backoff iterator over a [`RetryConfig`].
pub struct ExponentialBackoff {
    config: RetryConfig,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current_delay: config.base_delay,
            attempt: 0,
            config,
        }
    }

    /// Get the next delay, or None if the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let delay = self.current_delay;
        self.attempt += 1;

        let next =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(delay)
    }

    /// Retries consumed so far (1-based after the first `next_delay`).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The retry budget (u32::MAX when unbounded).
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.unwrap_or(u32::MAX)
    }
}
