//! Cooldown-windowed error reporting
//!
//! Repeated identical failures (same source and type) are noisy: a primary
//! store that is down for a minute will produce the same classified error on
//! every call. The reporter logs the first occurrence at the classified
//! severity and suppresses repeats inside a cooldown window. Suppression
//! affects observability only; retry and circuit-breaker decisions never go
//! through this type.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::classifier::{ErrorInfo, Severity};

/// Default suppression window for repeated identical errors
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Rate-limits logging of repeated identical errors
pub struct ErrorReporter {
    cooldown: Duration,
    last_reported: DashMap<String, Instant>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl ErrorReporter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_reported: DashMap::new(),
        }
    }

    /// Log the error unless the same (source, type) was reported within the
    /// cooldown window. Returns true when the error was actually logged.
    pub fn report(&self, info: &ErrorInfo) -> bool {
        let key = info.dedup_key();
        let now = Instant::now();

        if let Some(last) = self.last_reported.get(&key) {
            if now.duration_since(*last) < self.cooldown {
                debug!(
                    error_type = ?info.error_type,
                    source = info.source.as_deref().unwrap_or("-"),
                    "suppressing repeated error inside cooldown window"
                );
                return false;
            }
        }
        self.last_reported.insert(key, now);

        let source = info.source.as_deref().unwrap_or("-");
        match info.severity {
            Severity::Debug => debug!(
                category = ?info.category,
                error_type = ?info.error_type,
                source,
                "{}", info.message
            ),
            Severity::Info => info!(
                category = ?info.category,
                error_type = ?info.error_type,
                source,
                "{}", info.message
            ),
            Severity::Warning => warn!(
                category = ?info.category,
                error_type = ?info.error_type,
                source,
                "{}", info.message
            ),
            Severity::Error | Severity::Critical | Severity::Fatal => error!(
                category = ?info.category,
                error_type = ?info.error_type,
                source,
                severity = ?info.severity,
                "{}", info.message
            ),
        }
        true
    }

    /// Drop expired suppression entries
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.last_reported
            .retain(|_, last| now.duration_since(*last) < self.cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClassifier, RecallError};

    #[test]
    fn second_identical_error_is_suppressed() {
        let reporter = ErrorReporter::new(Duration::from_secs(60));
        let info = ErrorClassifier::new().classify(
            &RecallError::Network("down".to_string()),
            None,
            Some("primary-db"),
            None,
        );

        assert!(reporter.report(&info));
        assert!(!reporter.report(&info));
    }

    #[test]
    fn different_sources_are_reported_independently() {
        let reporter = ErrorReporter::new(Duration::from_secs(60));
        let classifier = ErrorClassifier::new();
        let err = RecallError::Network("down".to_string());

        let a = classifier.classify(&err, None, Some("primary-db"), None);
        let b = classifier.classify(&err, None, Some("backup-db"), None);

        assert!(reporter.report(&a));
        assert!(reporter.report(&b));
    }

    #[test]
    fn reported_again_after_cooldown() {
        let reporter = ErrorReporter::new(Duration::from_millis(0));
        let info = ErrorClassifier::new().classify(
            &RecallError::Network("down".to_string()),
            None,
            Some("primary-db"),
            None,
        );

        assert!(reporter.report(&info));
        assert!(reporter.report(&info));
    }
}
