//! Reconnect backoff policy.
//!
//! Exponential backoff with multiplicative jitter:
//!
//! ```text
//! delay(n) = min(max_delay, base_delay * 2^n) * (1 + u),   u ∈ [-jitter, +jitter]
//! ```
//!
//! `n` counts consecutive failed attempts starting at 0. After
//! `max_attempts` delays have been handed out without a [`reset`], the policy
//! is exhausted and [`next_delay`] returns `None`.
//!
//! [`reset`]: ReconnectPolicy::reset
//! [`next_delay`]: ReconnectPolicy::next_delay

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Default first delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default delay cap (before jitter).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter fraction.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Default number of consecutive attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Configuration for [`ReconnectPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1)`; values outside are clamped.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Snapshot of the policy for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconnectAttempt {
    /// Consecutive failed attempts so far.
    pub attempt: u32,
    /// Last delay handed out, in milliseconds.
    pub next_delay_ms: Option<u64>,
    /// Seed of the jitter generator.
    pub seed: u64,
    pub exhausted: bool,
}

/// Backoff state for one channel.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    last_delay: Option<Duration>,
    seed: u64,
    rng: StdRng,
}

impl ReconnectPolicy {
    /// Create a policy with a jitter generator seeded from `seed`.
    pub fn new(config: ReconnectConfig, seed: u64) -> Self {
        Self {
            config,
            attempt: 0,
            last_delay: None,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create a policy with a random seed.
    pub fn with_random_seed(config: ReconnectConfig) -> Self {
        Self::new(config, rand::random())
    }

    /// Un-jittered delay for `attempt`: `min(max_delay, base_delay * 2^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Jittered delay for `attempt`. Advances the jitter generator.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 0.999);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + self.rng.gen_range(-jitter..=jitter);
        base.mul_f64(factor)
    }

    /// Delay before the next attempt, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay(self.attempt);
        self.attempt += 1;
        self.last_delay = Some(delay);
        Some(delay)
    }

    /// Start over after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = None;
    }

    /// Consecutive attempts handed out since the last reset.
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn snapshot(&self) -> ReconnectAttempt {
        ReconnectAttempt {
            attempt: self.attempt,
            next_delay_ms: self.last_delay.map(|d| d.as_millis() as u64),
            seed: self.seed,
            exhausted: self.is_exhausted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.jitter, 0.2);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = ReconnectPolicy::new(ReconnectConfig::default(), 1);
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(4), Duration::from_secs(16));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default(), 42);
        for attempt in 0..12 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= base.mul_f64(0.8), "{:?} < 0.8 * {:?}", delay, base);
                assert!(delay <= base.mul_f64(1.2), "{:?} > 1.2 * {:?}", delay, base);
            }
        }
    }

    #[test]
    fn test_delays_non_decreasing_until_cap() {
        for seed in 0..20 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig::default(), seed);
            let mut previous = Duration::ZERO;
            let mut previous_base = Duration::ZERO;
            while let Some(delay) = policy.next_delay() {
                let base = policy.base_delay(policy.attempt() - 1);
                assert!(base >= previous_base);
                if base < policy.config().max_delay {
                    assert!(delay >= previous, "seed {}: {:?} < {:?}", seed, delay, previous);
                }
                previous = delay;
                previous_base = base;
            }
        }
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let config = ReconnectConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let mut policy = ReconnectPolicy::new(config, 7);

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.is_exhausted());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt(), 3);
    }

    #[test]
    fn test_reset_restarts_from_zero() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default(), 3);
        policy.next_delay();
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.attempt(), 3);

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        let delay = policy.next_delay().unwrap();
        assert!(delay <= Duration::from_millis(1200));
    }

    #[test]
    fn test_same_seed_same_delays() {
        let mut a = ReconnectPolicy::new(ReconnectConfig::default(), 99);
        let mut b = ReconnectPolicy::new(ReconnectConfig::default(), 99);
        for _ in 0..10 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let config = ReconnectConfig {
            jitter: 0.0,
            ..Default::default()
        };
        let mut policy = ReconnectPolicy::new(config, 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_snapshot() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default(), 5);
        policy.next_delay();
        let snap = policy.snapshot();
        assert_eq!(snap.attempt, 1);
        assert_eq!(snap.seed, 5);
        assert!(snap.next_delay_ms.is_some());
        assert!(!snap.exhausted);
    }
}
