//! Fault-tolerant persistence and resilience core for conversational assistants
//!
//! This crate isolates callers from transient failures of remote and local
//! data stores and provides crash-safe multi-step writes. It is built from a
//! small set of composable pieces:
//!
//! - [`error`]: structured error types plus a classification taxonomy that
//!   maps every failure to a category, severity, and default retry strategy
//! - [`patterns::retry`]: a retry engine with pluggable backoff
//! - [`patterns::circuit_breaker`]: per-dependency circuit breakers
//! - [`repository`]: a generic entity store interface with in-memory, redb,
//!   and file-per-entity backends, primary/backup failover, and a
//!   read/write-through cache decorator
//! - [`transaction`]: a durable write-ahead transaction log for atomic
//!   multi-entity operations
//!
//! Higher-level services (chat history, task memory, outbound integrations)
//! depend only on the [`repository::Repository`] trait and the resilience
//! entry points; concrete backends are wired at process start.

pub mod config;
pub mod error;
pub mod patterns;
pub mod repository;
pub mod transaction;
pub mod types;

pub use config::RecallConfig;
pub use error::{ErrorClassifier, ErrorInfo, RecallError, RecallResult, Result};
pub use patterns::{
    retry, BackoffStrategy, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    RetryConfig, RetryOutcome,
};
pub use repository::{
    CachedRepository, HealthReport, HealthState, PrimaryBackupRepository, Repository,
};
pub use transaction::{Operation, Transaction, TransactionManager, TransactionStatus};
pub use types::Entity;
