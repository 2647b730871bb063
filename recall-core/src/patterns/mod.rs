//! Resilience patterns shared across the persistence layer
//!
//! The retry engine and the circuit breaker are independent and composable:
//! a caller typically wraps a repository call in [`retry`], and the
//! operation itself may go through a [`CircuitBreaker`] guarding the
//! underlying dependency. Once a circuit is open, its rejections classify as
//! non-retryable, so the two layers do not fight each other.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use retry::{retry, retry_result, BackoffStrategy, RetryConfig, RetryOutcome};
