//! Retry and backoff for transient failures
//!
//! Executes a unit of work up to a bounded number of times, consulting the
//! error classifier (or a caller-supplied predicate) to decide whether a
//! given failure is worth retrying. Attempts are strictly sequential; there
//! is no end-to-end deadline spanning all retries, only an optional
//! per-attempt timeout. Callers wanting a hard deadline wrap the whole
//! [`retry`] call externally.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ErrorClassifier, RecallError, RecallResult, RetryStrategy};

/// Backoff strategy for retry operations
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Single attempt, no retries at all
    NoRetry,
    /// Retry immediately with zero delay
    Immediate,
    /// Linearly growing delay: base * (attempt + 1)
    Linear { base: Duration, max: Duration },
    /// Exponentially growing delay: base * multiplier^attempt
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
    /// Exponential delay randomized uniformly within ±20%
    Jittered {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

/// Jitter applied to the jittered strategy: delay * (0.8 to 1.2)
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

impl BackoffStrategy {
    /// Calculate the delay after the given zero-based attempt fails
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::NoRetry | BackoffStrategy::Immediate => Duration::ZERO,

            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(attempt.saturating_add(1));
                std::cmp::min(delay, *max)
            }

            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => exponential_delay(*base, *max, *multiplier, attempt),

            BackoffStrategy::Jittered {
                base,
                max,
                multiplier,
            } => {
                use rand::Rng;
                let exp = exponential_delay(*base, *max, *multiplier, attempt);
                let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
                let jittered = Duration::from_secs_f64(exp.as_secs_f64() * factor);
                std::cmp::min(jittered, *max)
            }
        }
    }

    /// Map a classified default strategy onto concrete delays
    pub fn for_strategy(strategy: RetryStrategy, base: Duration, max: Duration) -> Self {
        match strategy {
            RetryStrategy::NoRetry => BackoffStrategy::NoRetry,
            RetryStrategy::Immediate => BackoffStrategy::Immediate,
            RetryStrategy::LinearBackoff => BackoffStrategy::Linear { base, max },
            RetryStrategy::ExponentialBackoff => BackoffStrategy::Exponential {
                base,
                max,
                multiplier: 2.0,
            },
            RetryStrategy::JitteredBackoff => BackoffStrategy::Jittered {
                base,
                max,
                multiplier: 2.0,
            },
        }
    }
}

fn exponential_delay(base: Duration, max: Duration, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.powi(attempt.min(63) as i32);
    let delay = Duration::from_secs_f64((base.as_secs_f64() * factor).min(max.as_secs_f64()));
    std::cmp::min(delay, max)
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Observability hook invoked before each retry sleep
pub type OnRetry = Arc<dyn Fn(u32, &RecallError, Duration) + Send + Sync>;

/// Configuration for retry operations
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Backoff strategy to use between attempts
    pub strategy: BackoffStrategy,
    /// Timeout applied to each individual attempt. An elapsed timeout fails
    /// only that attempt and is itself retryable.
    pub attempt_timeout: Option<Duration>,
    /// Predicate deciding whether a failure is retryable. Defaults to the
    /// classifier's taxonomy table.
    pub is_retryable: fn(&RecallError) -> bool,
    /// Hook invoked before each retry sleep; panics are swallowed
    pub on_retry: Option<OnRetry>,
    /// Operation identifier for logging
    pub operation_name: Option<String>,
    /// Enable retry logging
    pub enable_logging: bool,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("operation_name", &self.operation_name)
            .field("enable_logging", &self.enable_logging)
            .finish()
    }
}

/// Default retryability check: consult the classifier's defaults table
fn default_is_retryable(error: &RecallError) -> bool {
    ErrorClassifier::new().is_retryable(error)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::default(),
            attempt_timeout: None,
            is_retryable: default_is_retryable,
            on_retry: None,
            operation_name: None,
            enable_logging: true,
        }
    }
}

impl RetryConfig {
    /// Config that performs exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            strategy: BackoffStrategy::NoRetry,
            ..Default::default()
        }
    }

    /// Retry config tuned for network-bound repository calls
    pub fn for_network(operation_name: &str) -> Self {
        Self {
            max_retries: 4,
            strategy: BackoffStrategy::Jittered {
                base: Duration::from_millis(100),
                max: Duration::from_secs(10),
                multiplier: 2.0,
            },
            attempt_timeout: Some(Duration::from_secs(30)),
            operation_name: Some(operation_name.to_string()),
            ..Default::default()
        }
    }

    /// Retry config tuned for local database operations
    pub fn for_database(operation_name: &str) -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Linear {
                base: Duration::from_millis(100),
                max: Duration::from_secs(2),
            },
            operation_name: Some(operation_name.to_string()),
            ..Default::default()
        }
    }

    /// Retry config for rate-limited upstream APIs: deliberately slow
    pub fn for_rate_limited(operation_name: &str) -> Self {
        Self {
            max_retries: 5,
            strategy: BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                multiplier: 2.0,
            },
            operation_name: Some(operation_name.to_string()),
            ..Default::default()
        }
    }

    /// Set the retryable predicate
    pub fn with_is_retryable(mut self, f: fn(&RecallError) -> bool) -> Self {
        self.is_retryable = f;
        self
    }

    /// Set the per-retry observability hook
    pub fn with_on_retry(
        mut self,
        hook: impl Fn(u32, &RecallError, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Set the per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Set operation name for better observability
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    fn effective_max_retries(&self) -> u32 {
        match self.strategy {
            BackoffStrategy::NoRetry => 0,
            _ => self.max_retries,
        }
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The operation eventually succeeded
    Success { value: T, attempts: u32 },
    /// Attempts were exhausted; carries the last failure
    Failure { error: RecallError, attempts: u32 },
    /// The failure was non-retryable and no further attempts were made
    Aborted { error: RecallError },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    /// Collapse the outcome into a plain result
    pub fn into_result(self) -> RecallResult<T> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Failure { error, .. } | RetryOutcome::Aborted { error } => Err(error),
        }
    }
}

/// Retry an async operation with the given configuration
///
/// Returns [`RetryOutcome::Aborted`] without sleeping when the first
/// non-retryable failure is seen, [`RetryOutcome::Failure`] with the last
/// error when attempts are exhausted.
pub async fn retry<F, T>(config: RetryConfig, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Pin<Box<dyn Future<Output = RecallResult<T>> + Send>>,
{
    let max_retries = config.effective_max_retries();
    let operation_name = config.operation_name.as_deref().unwrap_or("operation");
    let mut attempt: u32 = 0;

    loop {
        let result = run_attempt(&config, operation_name, operation()).await;

        match result {
            Ok(value) => {
                if attempt > 0 && config.enable_logging {
                    debug!(
                        "{} succeeded after {} attempts",
                        operation_name,
                        attempt + 1
                    );
                }
                return RetryOutcome::Success {
                    value,
                    attempts: attempt + 1,
                };
            }
            Err(error) => {
                if !(config.is_retryable)(&error) {
                    if config.enable_logging {
                        debug!("{} failed with non-retryable error: {}", operation_name, error);
                    }
                    return RetryOutcome::Aborted { error };
                }

                if attempt >= max_retries {
                    if config.enable_logging {
                        warn!(
                            "{} failed after {} attempts: {}",
                            operation_name,
                            attempt + 1,
                            error
                        );
                    }
                    return RetryOutcome::Failure {
                        error,
                        attempts: attempt + 1,
                    };
                }

                let delay = config.strategy.delay(attempt);

                if let Some(hook) = &config.on_retry {
                    // Hook failures are an observability concern only
                    let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        hook(attempt, &error, delay)
                    }));
                }

                if config.enable_logging {
                    warn!(
                        "Retry {}/{} for {} after error: {} (waiting {:?})",
                        attempt + 1,
                        max_retries,
                        operation_name,
                        error,
                        delay
                    );
                }

                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Retry and collapse the outcome into a plain result
pub async fn retry_result<F, T>(config: RetryConfig, operation: F) -> RecallResult<T>
where
    F: FnMut() -> Pin<Box<dyn Future<Output = RecallResult<T>> + Send>>,
{
    retry(config, operation).await.into_result()
}

async fn run_attempt<T>(
    config: &RetryConfig,
    operation_name: &str,
    fut: Pin<Box<dyn Future<Output = RecallResult<T>> + Send>>,
) -> RecallResult<T> {
    match config.attempt_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RecallError::Timeout {
                operation: operation_name.to_string(),
                duration: timeout,
            }),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_net_error() -> RecallError {
        RecallError::Network("temporary failure".to_string())
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let outcome = retry(RetryConfig::default(), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(count) })
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, 0);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let config = RetryConfig {
            strategy: BackoffStrategy::Immediate,
            ..Default::default()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let outcome = retry(config, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count < 2 {
                    Err(failing_net_error())
                } else {
                    Ok(count)
                }
            })
        })
        .await;

        assert!(outcome.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_failure() {
        let config = RetryConfig {
            max_retries: 2,
            strategy: BackoffStrategy::Immediate,
            ..Default::default()
        };

        let outcome = retry(config, move || {
            Box::pin(async move { Err::<(), _>(failing_net_error()) })
        })
        .await;

        match outcome {
            RetryOutcome::Failure { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_aborts_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let outcome = retry(RetryConfig::default(), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Err::<(), _>(RecallError::Validation {
                    field: "content".to_string(),
                    message: "must not be empty".to_string(),
                })
            })
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Aborted { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_retry_strategy_performs_zero_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let outcome = retry(RetryConfig::no_retry(), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Err::<(), _>(failing_net_error()) })
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Failure { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_timeout_is_retryable() {
        let config = RetryConfig {
            max_retries: 1,
            strategy: BackoffStrategy::Immediate,
            attempt_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let outcome = retry(config, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count == 0 {
                    // First attempt hangs past the timeout
                    sleep(Duration::from_millis(100)).await;
                }
                Ok(count)
            })
        })
        .await;

        assert!(outcome.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn on_retry_hook_observes_each_sleep() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        let config = RetryConfig {
            max_retries: 2,
            strategy: BackoffStrategy::Immediate,
            enable_logging: false,
            ..Default::default()
        }
        .with_on_retry(move |_attempt, _error, _delay| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _ = retry(config, move || {
            Box::pin(async move { Err::<(), _>(failing_net_error()) })
        })
        .await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_hook_is_swallowed() {
        let config = RetryConfig {
            max_retries: 1,
            strategy: BackoffStrategy::Immediate,
            enable_logging: false,
            ..Default::default()
        }
        .with_on_retry(|_, _, _| panic!("hook blew up"));

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let outcome = retry(config, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count == 0 {
                    Err(failing_net_error())
                } else {
                    Ok(count)
                }
            })
        })
        .await;

        assert!(outcome.is_success());
    }

    #[test]
    fn linear_backoff_grows_with_attempt() {
        let strategy = BackoffStrategy::Linear {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(strategy.delay(0), Duration::from_millis(100));
        assert_eq!(strategy.delay(1), Duration::from_millis(200));
        assert_eq!(strategy.delay(2), Duration::from_millis(300));
        // Capped at max
        assert_eq!(strategy.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_matches_formula() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        };
        for attempt in 0..10u32 {
            let expected = (1.0_f64 * 2.0_f64.powi(attempt as i32)).min(60.0);
            assert_eq!(strategy.delay(attempt), Duration::from_secs_f64(expected));
        }
        // Stays capped far past the crossover point
        assert_eq!(strategy.delay(40), Duration::from_secs(60));
    }

    proptest::proptest! {
        #[test]
        fn jittered_stays_within_20_percent(attempt in 0u32..12) {
            let strategy = BackoffStrategy::Jittered {
                base: Duration::from_millis(50),
                max: Duration::from_secs(600),
                multiplier: 2.0,
            };
            let exponential = 0.05_f64 * 2.0_f64.powi(attempt as i32);
            let delay = strategy.delay(attempt).as_secs_f64();
            proptest::prop_assert!(delay >= exponential * 0.8 - 1e-9);
            proptest::prop_assert!(delay <= exponential * 1.2 + 1e-9);
        }
    }

    #[test]
    fn immediate_and_no_retry_have_zero_delay() {
        assert_eq!(BackoffStrategy::Immediate.delay(5), Duration::ZERO);
        assert_eq!(BackoffStrategy::NoRetry.delay(0), Duration::ZERO);
    }
}
