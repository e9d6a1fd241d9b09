//! Tether Resilience: retry policy for worker calls
//!
//! # Overview
//!
//! Calls that fail with a transient connection error are retried under a
//! bounded [`RetryPolicy`]. The policy owns the attempt budget and the delay
//! schedule; deciding *which* failures are retryable is the caller's job.
//!
//! ```text
//! attempt 1 ──fail──> wait initial_backoff (± jitter)
//! attempt 2 ──fail──> wait initial_backoff × multiplier (± jitter, capped)
//! attempt 3 ──fail──> give up (max_attempts reached)
//! ```
//!
//! # Example
//!
//! ```
//! use tether_resilience::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 4,
//!     initial_backoff: Duration::from_millis(50),
//!     backoff: BackoffStrategy::Exponential,
//!     ..Default::default()
//! };
//!
//! assert!(policy.allows_retry_after(3));
//! assert!(!policy.allows_retry_after(4));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(100));
//! ```

pub mod error;
pub mod retry;

pub use error::ResilienceError;
pub use retry::{BackoffStrategy, RetryPolicy};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::error::ResilienceError;
    pub use super::retry::{BackoffStrategy, RetryPolicy};
}
