//! Error classification taxonomy
//!
//! Maps every failure to a typed [`ErrorInfo`]: category, fine-grained type,
//! source, severity, and a default retry strategy. The defaults table here is
//! the single source of truth consulted by the retry engine; the circuit
//! breaker and callers use the same classification to decide what to count
//! and what to show users.
//!
//! Classification precedence:
//! 1. an explicit status code carried by the error (fixed HTTP-status table)
//! 2. the error variant itself — the tag attached where the error was raised
//! 3. a last-resort lowercase keyword scan of the message, for opaque
//!    `Internal` errors only. Keyword matching is heuristic and
//!    wording-dependent; adapters should always raise a tagged variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::RecallError;

/// Broad failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    System,
    Network,
    Authentication,
    Validation,
    Integration,
    Model,
    Database,
    Memory,
    Timeout,
    Resource,
    Configuration,
    Logic,
    Unknown,
}

/// Fine-grained failure type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ConnectionError,
    TimeoutError,
    InvalidInput,
    InvalidApiKey,
    InsufficientPermissions,
    ResourceNotFound,
    ResourceConflict,
    ResourceExhausted,
    InvalidFormat,
    RateLimitExceeded,
    ApiError,
    ModelOverloaded,
    QueryError,
    StorageError,
    SerializationError,
    OutOfMemory,
    ConfigError,
    LogicError,
    CircuitOpen,
    UnknownError,
}

/// Severity assigned at classification time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

/// Default retry strategy derived once at classification time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    NoRetry,
    Immediate,
    LinearBackoff,
    ExponentialBackoff,
    JitteredBackoff,
}

/// Fully classified failure
///
/// `retry_strategy` is derived once from the defaults table and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub category: ErrorCategory,
    pub error_type: ErrorType,
    /// Which backend or integration produced the failure
    pub source: Option<String>,
    pub severity: Severity,
    pub retry_strategy: RetryStrategy,
    pub status_code: Option<u16>,
    /// Flat key/value context of simple values only
    pub context: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    /// Default user-facing message for the category
    pub fn user_message(&self) -> &'static str {
        match self.category {
            ErrorCategory::Network | ErrorCategory::Timeout => {
                "We're having trouble reaching one of our services. Please try again in a moment."
            }
            ErrorCategory::Authentication => {
                "Authentication failed. Please check your credentials."
            }
            ErrorCategory::Validation | ErrorCategory::Logic => {
                "The request could not be processed as given. Please adjust it and retry."
            }
            ErrorCategory::Model => {
                "The assistant's model is currently overloaded. Please try again shortly."
            }
            ErrorCategory::Integration => {
                "An external service returned an error. Please try again later."
            }
            ErrorCategory::Database | ErrorCategory::System | ErrorCategory::Memory => {
                "Something went wrong on our side. Your data is safe; please retry."
            }
            ErrorCategory::Resource => "A required resource is unavailable right now.",
            ErrorCategory::Configuration => {
                "The service is misconfigured. Please contact the operator."
            }
            ErrorCategory::Unknown => "An unexpected error occurred. Please try again.",
        }
    }

    /// Stable key identifying "the same" error for log rate limiting
    pub fn dedup_key(&self) -> String {
        match &self.source {
            Some(source) => format!("{}:{:?}", source, self.error_type),
            None => format!("-:{:?}", self.error_type),
        }
    }
}

/// Classifies raw failures into [`ErrorInfo`]
///
/// Classification never fails: anything it cannot place lands in
/// `Unknown`/`UnknownError` with a linear-backoff default.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure, optionally annotating the operation and source
    pub fn classify(
        &self,
        error: &RecallError,
        operation: Option<&str>,
        source: Option<&str>,
        context: Option<HashMap<String, String>>,
    ) -> ErrorInfo {
        let (category, error_type) = match error.status_code() {
            Some(status) => classify_status(status),
            None => classify_variant(error),
        };

        let (severity, retry_strategy) = defaults_for(category, error_type);

        let mut context = context.unwrap_or_default();
        if let Some(op) = operation {
            context.insert("operation".to_string(), op.to_string());
        }

        let source = source
            .map(str::to_string)
            .or_else(|| error.service().map(str::to_string));

        ErrorInfo {
            message: error.to_string(),
            category,
            error_type,
            source,
            severity,
            retry_strategy,
            status_code: error.status_code(),
            context,
            timestamp: Utc::now(),
        }
    }

    /// Default retry strategy for a failure, per the defaults table
    pub fn retry_strategy_for(&self, error: &RecallError) -> RetryStrategy {
        let (category, error_type) = match error.status_code() {
            Some(status) => classify_status(status),
            None => classify_variant(error),
        };
        defaults_for(category, error_type).1
    }

    /// Whether the defaults table considers this failure retryable at all
    pub fn is_retryable(&self, error: &RecallError) -> bool {
        self.retry_strategy_for(error) != RetryStrategy::NoRetry
    }
}

/// Fixed HTTP-status mapping, consulted before anything else
fn classify_status(status: u16) -> (ErrorCategory, ErrorType) {
    match status {
        400 => (ErrorCategory::Validation, ErrorType::InvalidInput),
        401 => (ErrorCategory::Authentication, ErrorType::InvalidApiKey),
        403 => (
            ErrorCategory::Authentication,
            ErrorType::InsufficientPermissions,
        ),
        404 => (ErrorCategory::Resource, ErrorType::ResourceNotFound),
        409 => (ErrorCategory::Resource, ErrorType::ResourceConflict),
        422 => (ErrorCategory::Validation, ErrorType::InvalidFormat),
        429 => (ErrorCategory::Integration, ErrorType::RateLimitExceeded),
        500 | 502 => (ErrorCategory::Integration, ErrorType::ApiError),
        503 => (ErrorCategory::Model, ErrorType::ModelOverloaded),
        504 => (ErrorCategory::Timeout, ErrorType::TimeoutError),
        _ => (ErrorCategory::Integration, ErrorType::ApiError),
    }
}

/// Variant-tag mapping: the classification attached where the error was
/// raised. Only `Internal` falls through to message scanning.
fn classify_variant(error: &RecallError) -> (ErrorCategory, ErrorType) {
    match error {
        RecallError::Storage { .. } => (ErrorCategory::System, ErrorType::StorageError),
        RecallError::Serialization { .. } => {
            (ErrorCategory::System, ErrorType::SerializationError)
        }
        RecallError::Database { .. } => (ErrorCategory::Database, ErrorType::QueryError),
        RecallError::Io(_) => (ErrorCategory::System, ErrorType::StorageError),
        RecallError::Network(_) => (ErrorCategory::Network, ErrorType::ConnectionError),
        RecallError::Connection { .. } => (ErrorCategory::Network, ErrorType::ConnectionError),
        RecallError::Timeout { .. } => (ErrorCategory::Timeout, ErrorType::TimeoutError),
        RecallError::TemporaryFailure { .. } => {
            (ErrorCategory::System, ErrorType::UnknownError)
        }
        RecallError::Api { .. } => (ErrorCategory::Integration, ErrorType::ApiError),
        RecallError::RateLimited { .. } => {
            (ErrorCategory::Integration, ErrorType::RateLimitExceeded)
        }
        RecallError::ModelOverloaded { .. } => (ErrorCategory::Model, ErrorType::ModelOverloaded),
        RecallError::Validation { .. } => (ErrorCategory::Validation, ErrorType::InvalidInput),
        RecallError::InvalidInput { .. } => (ErrorCategory::Validation, ErrorType::InvalidInput),
        RecallError::Configuration { .. } => {
            (ErrorCategory::Configuration, ErrorType::ConfigError)
        }
        RecallError::Authentication { .. } => {
            (ErrorCategory::Authentication, ErrorType::InvalidApiKey)
        }
        RecallError::Authorization { .. } => (
            ErrorCategory::Authentication,
            ErrorType::InsufficientPermissions,
        ),
        RecallError::NotFound { .. } => (ErrorCategory::Resource, ErrorType::ResourceNotFound),
        RecallError::AlreadyExists { .. } => {
            (ErrorCategory::Resource, ErrorType::ResourceConflict)
        }
        RecallError::ResourceExhausted { .. } => {
            (ErrorCategory::Resource, ErrorType::ResourceExhausted)
        }
        RecallError::CircuitOpen { .. } => (ErrorCategory::System, ErrorType::CircuitOpen),
        RecallError::NotImplemented { .. } => (ErrorCategory::Logic, ErrorType::LogicError),
        RecallError::Internal { message } => classify_message(message),
    }
}

/// Last-resort keyword scan for opaque errors
fn classify_message(message: &str) -> (ErrorCategory, ErrorType) {
    let lower = message.to_lowercase();

    const NETWORK_KEYWORDS: &[&str] = &["connection", "network", "unreachable", "refused", "dns"];
    const AUTH_KEYWORDS: &[&str] = &["unauthorized", "api key", "forbidden", "credential"];
    const DATABASE_KEYWORDS: &[&str] = &["database", "sql", "query", "constraint", "deadlock"];
    const MODEL_KEYWORDS: &[&str] = &["model", "overloaded", "context length", "token limit"];

    if NETWORK_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (ErrorCategory::Network, ErrorType::ConnectionError)
    } else if AUTH_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (ErrorCategory::Authentication, ErrorType::InvalidApiKey)
    } else if DATABASE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (ErrorCategory::Database, ErrorType::QueryError)
    } else if MODEL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (ErrorCategory::Model, ErrorType::ModelOverloaded)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        (ErrorCategory::Timeout, ErrorType::TimeoutError)
    } else {
        (ErrorCategory::Unknown, ErrorType::UnknownError)
    }
}

/// Static defaults: severity and retry strategy per (category, type)
fn defaults_for(category: ErrorCategory, error_type: ErrorType) -> (Severity, RetryStrategy) {
    match (category, error_type) {
        // Fail fast: no amount of retrying fixes the request itself
        (ErrorCategory::Validation, _)
        | (ErrorCategory::Configuration, _)
        | (ErrorCategory::Logic, _) => (Severity::Warning, RetryStrategy::NoRetry),
        (ErrorCategory::Authentication, _) => (Severity::Error, RetryStrategy::NoRetry),

        // Deliberately slow the caller down
        (_, ErrorType::RateLimitExceeded) => (Severity::Warning, RetryStrategy::ExponentialBackoff),
        (_, ErrorType::ModelOverloaded) => (Severity::Warning, RetryStrategy::ExponentialBackoff),

        // Transient infrastructure trouble
        (ErrorCategory::Network, _) | (ErrorCategory::Timeout, _) => {
            (Severity::Warning, RetryStrategy::JitteredBackoff)
        }
        (ErrorCategory::Database, _) => (Severity::Error, RetryStrategy::LinearBackoff),
        (ErrorCategory::Integration, _) => (Severity::Error, RetryStrategy::JitteredBackoff),

        (_, ErrorType::ResourceNotFound) | (_, ErrorType::ResourceConflict) => {
            (Severity::Info, RetryStrategy::NoRetry)
        }
        (ErrorCategory::Resource, _) => (Severity::Warning, RetryStrategy::LinearBackoff),
        (ErrorCategory::Memory, ErrorType::OutOfMemory) => {
            (Severity::Critical, RetryStrategy::NoRetry)
        }
        (ErrorCategory::Memory, _) => (Severity::Error, RetryStrategy::LinearBackoff),

        // The breaker already decided; retrying through it is pointless
        (_, ErrorType::CircuitOpen) => (Severity::Warning, RetryStrategy::NoRetry),

        (ErrorCategory::System, _) => (Severity::Error, RetryStrategy::LinearBackoff),
        (ErrorCategory::Model, _) => (Severity::Error, RetryStrategy::ExponentialBackoff),
        (ErrorCategory::Unknown, _) => (Severity::Error, RetryStrategy::LinearBackoff),
    }
}
