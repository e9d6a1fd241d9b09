//! Error types for tether-resilience

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    #[error("Retry policy must allow at least one attempt")]
    NoAttempts,

    #[error("Backoff multiplier must be >= 1.0 (got {0})")]
    InvalidMultiplier(f64),

    #[error("Jitter factor must be within [0.0, 1.0] (got {0})")]
    InvalidJitter(f64),

    #[error("Initial backoff exceeds the maximum backoff")]
    BackoffOutOfOrder,
}
