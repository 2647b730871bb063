//! Error handling for Recall
//!
//! Errors are never silently dropped at the repository boundary: every
//! failure is a structured [`RecallError`] variant, classified into the
//! taxonomy by [`ErrorClassifier`] before being retried, counted against a
//! circuit breaker, or surfaced to a caller.
//!
//! The taxonomy drives the whole resilience layer:
//!
//! - validation/configuration/logic errors are never retried and propagate
//!   immediately
//! - network, timeout, and database errors are retried with jittered or
//!   linear backoff
//! - rate-limit and model-overload errors use exponential backoff to slow
//!   the caller deliberately
//! - once a dependency's circuit is open, all calls short-circuit to
//!   [`RecallError::CircuitOpen`] without reclassification

pub mod classifier;
pub mod reporter;
pub mod types;

pub use classifier::{
    ErrorCategory, ErrorClassifier, ErrorInfo, ErrorType, RetryStrategy, Severity,
};
pub use reporter::ErrorReporter;
pub use types::{RecallError, RecallResult, Result};
