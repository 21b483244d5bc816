//! Reconnect schedule: exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Reconnect schedule parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// First delay
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Relative jitter, 0.2 means ±20%
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// Exponential backoff state for one reconnect sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh sequence
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt
    pub fn base_delay(&self) -> Duration {
        let exp = self.attempt.min(16);
        self.config
            .base
            .saturating_mul(1u32 << exp)
            .min(self.config.max)
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.config.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        });
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..100 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(799), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1201), "{:?}", delay);
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.base_delay(), Duration::from_secs(1));
    }
}
