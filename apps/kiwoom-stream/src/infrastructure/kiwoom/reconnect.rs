//! Reconnection Policy
//!
//! Bounded exponential backoff with jitter and an attempt budget. The
//! session supervisor asks for the next delay after every failed attempt
//! and resets the policy once a connection reaches STREAMING again.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::StreamConfig;

/// Backoff shape and attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempt budget (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Build from the stream configuration.
    #[must_use]
    pub const fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            initial_delay: config.reconnect_delay_initial,
            max_delay: config.reconnect_delay_max,
            multiplier: config.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Un-jittered delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let initial_ms = self.initial_delay.as_millis() as f64;
        #[allow(clippy::cast_precision_loss)]
        let max_ms = self.max_delay.as_millis() as f64;

        let scaled = initial_ms * self.multiplier.max(1.0).powi(exponent);
        let bounded = if scaled.is_finite() { scaled.min(max_ms) } else { max_ms };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = bounded.round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Attempt counter that hands out jittered backoff delays.
///
/// # Example
///
/// ```rust
/// use kiwoom_stream::infrastructure::kiwoom::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// let first = policy.next_delay();
/// assert!(first.is_some());
/// assert_eq!(policy.attempt_count(), 1);
///
/// // Connection restored
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Fresh policy with the full budget.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Policy settings.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Consume one attempt and return how long to wait before it.
    ///
    /// Returns `None` once the attempt budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let base = self.config.base_delay(self.attempt_count);
        Some(self.apply_jitter(base))
    }

    /// Restore the full budget.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether the budget allows another attempt.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_ms = base.as_millis() as f64;
        #[allow(clippy::cast_precision_loss)]
        let max_ms = self.config.max_delay.as_millis() as f64;
        let spread = base_ms * self.config.jitter_factor;

        let jitter: f64 = rand::rng().random_range(-spread..=spread);
        let adjusted = (base_ms + jitter).clamp(1.0, max_ms.max(1.0));

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = adjusted as u64;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::kiwoom::auth::AccessToken;

    fn exact(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn follows_stream_config() {
        let stream = StreamConfig {
            reconnect_delay_initial: Duration::from_millis(250),
            reconnect_delay_max: Duration::from_secs(4),
            reconnect_delay_multiplier: 3.0,
            max_reconnect_attempts: 7,
            ..StreamConfig::new(AccessToken::new("tok").unwrap())
        };

        let config = ReconnectConfig::from_stream_config(&stream);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(4));
        assert_eq!(config.max_attempts, 7);
        assert!((config.multiplier - 3.0).abs() < f64::EPSILON);
    }

    #[test_case(1 => 100 ; "first attempt waits the initial delay")]
    #[test_case(2 => 200 ; "second doubles")]
    #[test_case(4 => 800 ; "fourth")]
    #[test_case(8 => 10_000 ; "ceiling reached")]
    #[test_case(u32::MAX => 10_000 ; "no overflow")]
    fn base_delay_ms(attempt: u32) -> u128 {
        exact(0).base_delay(attempt).as_millis()
    }

    #[test]
    fn sub_unit_multiplier_never_shrinks() {
        let config = ReconnectConfig {
            multiplier: 0.5,
            ..exact(0)
        };
        assert_eq!(config.base_delay(5), Duration::from_millis(100));
    }

    #[test]
    fn budget_counts_every_attempt() {
        let mut policy = ReconnectPolicy::new(exact(3));

        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();

        assert_eq!(
            delays,
            [100, 200, 400].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.attempt_count(), 3);
        assert!(!policy.should_retry());
    }

    #[test]
    fn reset_restores_budget_and_initial_delay() {
        let mut policy = ReconnectPolicy::new(exact(2));
        while policy.next_delay().is_some() {}

        policy.reset();

        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn zero_budget_means_unlimited() {
        let mut policy = ReconnectPolicy::new(exact(0));
        assert_eq!((0..500).filter_map(|_| policy.next_delay()).count(), 500);
        assert_eq!(policy.attempt_count(), 500);
    }

    #[test]
    fn jitter_is_ten_percent_and_respects_ceiling() {
        let spread = ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            ..ReconnectConfig::default()
        };
        let tight = ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.5,
            ..ReconnectConfig::default()
        };

        for _ in 0..100 {
            let ms = ReconnectPolicy::new(spread.clone()).next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&ms), "delay {ms}ms outside 10% band");

            let capped = ReconnectPolicy::new(tight.clone()).next_delay().unwrap();
            assert!(capped <= Duration::from_millis(500));
        }
    }
}
