//! Core error types for Recall
//!
//! This module contains the main RecallError enum with all error variants
//! and the associated Result aliases. Variants carry enough structure for
//! the classifier to derive category, severity, and retry strategy without
//! inspecting message text: backend adapters must raise the variant that
//! matches the failure, and API failures must populate the explicit
//! `status` field.

use std::time::Duration;
use thiserror::Error;

/// Structured error type for all Recall operations
///
/// # Error Categories
///
/// - **System Errors**: infrastructure failures (storage, IO, internal)
/// - **Network Errors**: connectivity and remote-endpoint failures
/// - **Database Errors**: query and durable-store failures
/// - **Integration Errors**: upstream API failures with explicit status codes
/// - **Logic Errors**: validation, configuration, authentication (fail fast)
/// - **Temporary Errors**: transient failures expected to succeed on retry
#[derive(Error, Debug)]
pub enum RecallError {
    // Storage & IO
    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Database error: {operation} failed")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Network
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection error to {address}: {details}")]
    Connection { address: String, details: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Temporary failure: {details}")]
    TemporaryFailure { details: String },

    // Upstream integrations (model providers, external APIs).
    // `status` is mandatory: adapters translate their library errors into
    // this variant with the received HTTP status.
    #[error("API error from {service} (status {status}): {message}")]
    Api {
        service: String,
        status: u16,
        message: String,
    },

    #[error("Rate limited by {service}, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("Model overloaded: {service}")]
    ModelOverloaded { service: String },

    // Logic & configuration (never retried)
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Authentication error: {message}")]
    Authentication { message: String },

    #[error("Authorization error: {message}")]
    Authorization { message: String },

    // Resources
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    // Resilience layer
    #[error(
        "Circuit breaker '{service}' is open ({failure_count} consecutive failures, open for {open_for:?})"
    )]
    CircuitOpen {
        service: String,
        failure_count: u32,
        open_for: Duration,
        last_error: Option<String>,
    },

    // Internal & implementation
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Feature not implemented: {feature}")]
    NotImplemented { feature: String },
}

impl RecallError {
    /// Explicit HTTP-style status code, where the failure carries one.
    ///
    /// Adapters populate the status at the point the error is raised; the
    /// classifier consults this before anything else and never probes
    /// message text for digits.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RecallError::Api { status, .. } => Some(*status),
            RecallError::RateLimited { .. } => Some(429),
            RecallError::ModelOverloaded { .. } => Some(503),
            _ => None,
        }
    }

    /// Name of the failing dependency, where the failure identifies one
    pub fn service(&self) -> Option<&str> {
        match self {
            RecallError::Api { service, .. }
            | RecallError::RateLimited { service, .. }
            | RecallError::ModelOverloaded { service }
            | RecallError::CircuitOpen { service, .. } => Some(service),
            RecallError::Connection { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Whether this failure came from the circuit breaker rejecting the
    /// call without invoking the protected operation
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RecallError::CircuitOpen { .. })
    }
}

impl From<serde_json::Error> for RecallError {
    fn from(err: serde_json::Error) -> Self {
        RecallError::Serialization {
            operation: "json".to_string(),
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecallError>;
pub type RecallResult<T> = std::result::Result<T, RecallError>;
