//! Reconnect wait schedule

use crate::config::PostmanConfig;
use rand::Rng;
use std::time::Duration;

/// Produces the wait before each reconnect attempt
///
/// Every wait is the current base plus a uniform random component in
/// `[0, jitter]`. With exponential backoff the base doubles after every
/// attempt, capped at the configured maximum so a long outage still gets
/// retried every few minutes. Pass `Duration::MAX` as the maximum for
/// unbounded doubling. Each reconnect loop starts a fresh schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    jitter: Duration,
    max: Duration,
    exponential: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, jitter: Duration, max: Duration, exponential: bool) -> Self {
        Self {
            base,
            jitter,
            max,
            exponential,
            attempt: 0,
        }
    }

    pub fn from_config(config: &PostmanConfig) -> Self {
        Self::new(
            config.reconnect_delay,
            config.reconnect_jitter,
            config.max_reconnect_delay,
            config.exponential_backoff,
        )
    }

    /// Number of waits handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Base wait for the next attempt, before jitter
    pub fn current_base(&self) -> Duration {
        if !self.exponential {
            return self.base;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        self.base.saturating_mul(factor).min(self.max.max(self.base))
    }

    /// Wait before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_base();
        self.attempt = self.attempt.saturating_add(1);
        base + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay_stays_within_jitter() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(300),
            false,
        );

        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1), "{:?}", delay);
            assert!(delay <= Duration::from_secs(2), "{:?}", delay);
        }
        assert_eq!(backoff.attempt(), 50);
    }

    #[test]
    fn test_exponential_base_doubles() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::ZERO,
            Duration::from_secs(300),
            true,
        );

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );
    }

    #[test]
    fn test_exponential_base_is_capped() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_secs(5),
            true,
        );

        for _ in 0..40 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(5010), "{:?}", delay);
        }
        assert_eq!(backoff.current_base(), Duration::from_secs(5));
    }

    #[test]
    fn test_uncapped_with_duration_max() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::MAX,
            true,
        );

        for _ in 0..12 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current_base(), Duration::from_secs(4096));
    }

    #[test]
    fn test_from_config() {
        let config = PostmanConfig::new("host")
            .exponential_backoff()
            .reconnect_delay(Duration::from_millis(250), Duration::ZERO);
        let mut backoff = Backoff::from_config(&config);

        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
