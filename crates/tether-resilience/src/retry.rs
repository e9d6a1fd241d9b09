//! Bounded retry policy with capped backoff
//!
//! The schedule is tunable: defaults are conservative (3 attempts, 100 ms
//! initial delay doubling up to 5 s, up to 20% jitter) and every field can be
//! overridden from configuration.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ResilienceError;

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,

    /// Delay grows by `initial_backoff` per retry
    Linear,

    /// Delay multiplies by `backoff_multiplier` per retry
    Exponential,

    /// Exponential with random jitter so workers do not retry in lockstep
    ExponentialWithJitter,
}

/// Retry policy for a single call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the computed delay (before jitter)
    pub max_backoff: Duration,
    /// Growth factor for exponential strategies
    pub backoff_multiplier: f64,
    pub backoff: BackoffStrategy,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Same schedule, different attempt budget
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Reject configurations that cannot produce a sane schedule
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::NoAttempts);
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ResilienceError::InvalidMultiplier(self.backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ResilienceError::InvalidJitter(self.jitter_factor));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ResilienceError::BackoffOutOfOrder);
        }
        Ok(())
    }

    /// True if another attempt may follow `attempts_made` attempts
    pub fn allows_retry_after(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base = match self.backoff {
            BackoffStrategy::Fixed => self.initial_backoff,
            BackoffStrategy::Linear => self.initial_backoff.saturating_mul(retry),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let factor = self.backoff_multiplier.powi(retry as i32 - 1);
                let secs = self.initial_backoff.as_secs_f64() * factor;
                if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.max_backoff
                }
            }
        };

        let capped = base.min(self.max_backoff);

        if self.backoff == BackoffStrategy::ExponentialWithJitter && self.jitter_factor > 0.0 {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            capped + Duration::from_secs_f64(capped.as_secs_f64() * jitter)
        } else {
            capped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
            backoff: strategy,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_exponential_is_capped() {
        let policy = exact(BackoffStrategy::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_linear_and_fixed() {
        assert_eq!(
            exact(BackoffStrategy::Linear).delay_for(3),
            Duration::from_millis(300)
        );
        assert_eq!(
            exact(BackoffStrategy::Fixed).delay_for(4),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..exact(BackoffStrategy::ExponentialWithJitter)
        };
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));

        let single = RetryPolicy::single_attempt();
        assert!(!single.allows_retry_after(1));
    }

    #[test]
    fn test_validation_errors() {
        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(zero.validate(), Err(ResilienceError::NoAttempts));

        let shrinking = RetryPolicy {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert_eq!(
            shrinking.validate(),
            Err(ResilienceError::InvalidMultiplier(0.5))
        );

        let noisy = RetryPolicy {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert_eq!(noisy.validate(), Err(ResilienceError::InvalidJitter(1.5)));

        let inverted = RetryPolicy {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(inverted.validate(), Err(ResilienceError::BackoffOutOfOrder));
    }

    #[test]
    fn test_with_max_attempts_keeps_schedule() {
        let policy = exact(BackoffStrategy::Exponential).with_max_attempts(1);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&BackoffStrategy::ExponentialWithJitter).unwrap();
        assert_eq!(json, "\"exponential_with_jitter\"");
    }
}
