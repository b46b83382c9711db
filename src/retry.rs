//! Retry policy for optimistic-concurrency conflicts.
//!
//! Updates against the API server race with other writers; a lost race comes
//! back as a 409 conflict and the correct response is to re-read and try
//! again. This module holds the backoff policy those retry loops share. It
//! uses exponential backoff with jitter to avoid thundering herd problems.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for update loops that re-read and retry on conflict.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// True if another attempt is allowed after `attempt` attempts have run
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Apply jitter to a delay: 0.5x to 1.5x of the nominal value
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }

    /// The delay to use after `delay`, exponentially grown and capped
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_bounded() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert!(config.allows_retry(1));
        assert!(config.allows_retry(4));
        assert!(!config.allows_retry(5));
    }

    #[test]
    fn test_zero_attempts_means_unbounded() {
        let config = RetryConfig::with_max_attempts(0);
        assert!(config.allows_retry(1_000_000));
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };

        let d1 = config.next_delay(config.initial_delay);
        assert_eq!(d1, Duration::from_millis(200));
        let d2 = config.next_delay(d1);
        assert_eq!(d2, Duration::from_millis(400));
        let d3 = config.next_delay(d2);
        assert_eq!(d3, Duration::from_millis(500));
        let d4 = config.next_delay(d3);
        assert_eq!(d4, Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig::default();
        let nominal = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = config.jittered(nominal);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered < Duration::from_millis(150));
        }
    }
}
