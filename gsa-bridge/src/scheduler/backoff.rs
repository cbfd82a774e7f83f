//! Exponential backoff for connector initialization retries.

use std::time::Duration;

/// Default first retry delay (1 second).
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default maximum retry delay (1 hour).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// Configuration for [`InitBackoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Doubling delay sequence: 1 s, 2 s, 4 s, ... capped at the maximum.
#[derive(Debug, Clone)]
pub struct InitBackoff {
    config: BackoffConfig,
    next: Duration,
    attempts: u32,
}

impl InitBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            config,
            attempts: 0,
        }
    }

    /// Delay to wait after the latest failure; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.config.max_delay);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial_delay.min(self.config.max_delay);
        self.attempts = 0;
    }
}

impl Default for InitBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
