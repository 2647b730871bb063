//! Circuit breaker for failing dependencies
//!
//! A per-dependency state machine that fails fast once a dependency is
//! judged unhealthy, instead of stacking retries on top of a dead backend.
//!
//! States:
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected immediately with
//!   [`RecallError::CircuitOpen`]; the wrapped operation is never invoked
//! - **Half-Open**: after the cooldown elapses, exactly one probe call is
//!   let through; its result decides whether the circuit closes or reopens
//!   with a longer cooldown
//!
//! The breaker must be usable from async tasks and from worker threads doing
//! blocking I/O, unlike the rest of the core which assumes cooperative
//! scheduling. All state lives behind one `parking_lot::Mutex`; the lock is
//! never held across the protected call (admit, run, record), so a breaker
//! invoked recursively from within its own protected operation behaves like
//! any concurrent caller rather than deadlocking.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RecallError, RecallResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Failing fast, requests are rejected immediately
    Open,
    /// Testing whether the dependency has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures before the circuit opens
    pub failure_threshold: u32,
    /// Initial cooldown before a half-open probe is admitted
    pub reset_timeout: Duration,
    /// Growth factor applied to the cooldown on each failed probe
    pub timeout_multiplier: f64,
    /// Upper bound on the cooldown
    pub max_timeout: Duration,
    /// Timeout for individual operations (None = no timeout); applies to
    /// the async path only
    pub operation_timeout: Option<Duration>,
    /// Failures matching this predicate never count toward the threshold
    /// and never change breaker state
    pub is_excluded: fn(&RecallError) -> bool,
    /// Log state transitions
    pub enable_logging: bool,
}

/// Default exclude-list: caller mistakes, not dependency health signals
fn default_excluded(error: &RecallError) -> bool {
    matches!(
        error,
        RecallError::Validation { .. }
            | RecallError::InvalidInput { .. }
            | RecallError::Configuration { .. }
            | RecallError::Authorization { .. }
            | RecallError::NotFound { .. }
            | RecallError::AlreadyExists { .. }
            | RecallError::NotImplemented { .. }
    )
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            timeout_multiplier: 2.0,
            max_timeout: Duration::from_secs(600),
            operation_timeout: None,
            is_excluded: default_excluded,
            enable_logging: true,
        }
    }
}

/// Point-in-time view of a breaker, for ops surfaces
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub current_timeout: Duration,
    pub open_for: Option<Duration>,
    pub last_error: Option<String>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    current_timeout: Duration,
    probe_in_flight: bool,
    last_error: Option<String>,
}

enum Admission {
    Allowed { probe: bool },
    Rejected(RecallError),
}

/// Circuit breaker guarding one named dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,

    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let current_timeout = config.reset_timeout;
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                current_timeout,
                probe_in_flight: false,
                last_error: None,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Execute an async operation through the circuit breaker
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RecallResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecallResult<T>>,
    {
        let probe = match self.admit() {
            Admission::Allowed { probe } => probe,
            Admission::Rejected(err) => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let result = match self.config.operation_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(RecallError::Timeout {
                    operation: format!("circuit breaker '{}'", self.name),
                    duration: timeout,
                }),
            },
            None => operation().await,
        };

        self.record(&result, probe);
        result
    }

    /// Execute a blocking operation through the circuit breaker
    ///
    /// Used from worker threads outside the async runtime. The configured
    /// operation timeout is not applied here; a blocking closure cannot be
    /// interrupted from this layer.
    pub fn execute_sync<F, T>(&self, operation: F) -> RecallResult<T>
    where
        F: FnOnce() -> RecallResult<T>,
    {
        let probe = match self.admit() {
            Admission::Allowed { probe } => probe,
            Admission::Rejected(err) => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let result = operation();
        self.record(&result, probe);
        result
    }

    fn admit(&self) -> Admission {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => Admission::Allowed { probe: false },
            CircuitState::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= s.current_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.probe_in_flight = true;
                    if self.config.enable_logging {
                        info!(
                            "Circuit breaker '{}' half-open after {:?}, admitting probe",
                            self.name, elapsed
                        );
                    }
                    Admission::Allowed { probe: true }
                } else {
                    Admission::Rejected(self.rejection(&s))
                }
            }
            CircuitState::HalfOpen => {
                if s.probe_in_flight {
                    // Only one probe may be in flight; losers fail fast
                    Admission::Rejected(self.rejection(&s))
                } else {
                    s.probe_in_flight = true;
                    Admission::Allowed { probe: true }
                }
            }
        }
    }

    fn rejection(&self, s: &BreakerState) -> RecallError {
        RecallError::CircuitOpen {
            service: self.name.clone(),
            failure_count: s.failure_count,
            open_for: s.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO),
            last_error: s.last_error.clone(),
        }
    }

    fn record<T>(&self, result: &RecallResult<T>, probe: bool) {
        match result {
            Ok(_) => {
                self.successful_calls.fetch_add(1, Ordering::Relaxed);
                self.on_success(probe);
            }
            Err(error) => {
                if (self.config.is_excluded)(error) {
                    debug!(
                        "Circuit breaker '{}': excluded error does not count: {}",
                        self.name, error
                    );
                    if probe {
                        // The probe slot is free again; state is unchanged
                        self.state.lock().probe_in_flight = false;
                    }
                } else {
                    self.failed_calls.fetch_add(1, Ordering::Relaxed);
                    self.on_failure(probe, error);
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut s = self.state.lock();
        if probe {
            s.probe_in_flight = false;
        }
        match s.state {
            CircuitState::HalfOpen if probe => {
                s.state = CircuitState::Closed;
                s.failure_count = 0;
                s.opened_at = None;
                s.current_timeout = self.config.reset_timeout;
                s.last_error = None;
                if self.config.enable_logging {
                    info!("Circuit breaker '{}' closed after successful probe", self.name);
                }
            }
            CircuitState::Closed => {
                s.failure_count = 0;
            }
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool, error: &RecallError) {
        let mut s = self.state.lock();
        s.failure_count = s.failure_count.saturating_add(1);
        s.last_error = Some(error.to_string());

        if probe {
            s.probe_in_flight = false;
        }

        match s.state {
            CircuitState::HalfOpen if probe => {
                // Failed probe: reopen with a longer cooldown
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
                s.current_timeout = grow_timeout(
                    s.current_timeout,
                    self.config.timeout_multiplier,
                    self.config.max_timeout,
                );
                if self.config.enable_logging {
                    warn!(
                        "Circuit breaker '{}' reopened after failed probe, cooldown now {:?}",
                        self.name, s.current_timeout
                    );
                }
            }
            CircuitState::Closed => {
                if s.failure_count >= self.config.failure_threshold {
                    s.state = CircuitState::Open;
                    s.opened_at = Some(Instant::now());
                    s.current_timeout = self.config.reset_timeout;
                    if self.config.enable_logging {
                        warn!(
                            "Circuit breaker '{}' opened after {} consecutive failures: {}",
                            self.name, s.failure_count, error
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Name of the dependency this breaker protects
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Current consecutive-failure count
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let s = self.state.lock();
        CircuitBreakerStats {
            state: s.state,
            failure_count: s.failure_count,
            current_timeout: s.current_timeout,
            open_for: s.opened_at.map(|t| t.elapsed()),
            last_error: s.last_error.clone(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed, clearing all failure state
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.opened_at = None;
        s.current_timeout = self.config.reset_timeout;
        s.probe_in_flight = false;
        s.last_error = None;
        if self.config.enable_logging {
            info!("Circuit breaker '{}' reset to closed", self.name);
        }
    }

    /// Operator override: force the breaker open unconditionally
    pub fn force_open(&self, reason: &str) {
        let mut s = self.state.lock();
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.probe_in_flight = false;
        s.last_error = Some(format!("forced open: {}", reason));
        if self.config.enable_logging {
            warn!("Circuit breaker '{}' forced open: {}", self.name, reason);
        }
    }
}

fn grow_timeout(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let grown = Duration::from_secs_f64(current.as_secs_f64() * multiplier);
    std::cmp::min(grown, max)
}

/// Process-wide set of named circuit breakers
///
/// Constructed once at startup and passed by dependency injection to every
/// component that protects an outbound dependency, so unrelated call sites
/// naming the same dependency share one breaker.
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    /// Look up or create the breaker for a dependency name
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Look up or create with a non-default configuration. The config only
    /// applies when the breaker does not exist yet.
    pub fn breaker_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Stats for every registered breaker
    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerStats)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Reset every registered breaker to closed
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    fn quick_config(threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            timeout_multiplier: 2.0,
            max_timeout: Duration::from_millis(reset_ms * 8),
            enable_logging: false,
            ..Default::default()
        }
    }

    fn net_failure() -> RecallError {
        RecallError::Network("backend down".to_string())
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(net_failure()) })
            .await;
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let breaker = CircuitBreaker::new("test", quick_config(3, 100));

        for i in 0..3 {
            if i < 2 {
                fail(&breaker).await;
                assert_eq!(breaker.state(), CircuitState::Closed);
            } else {
                fail(&breaker).await;
            }
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[tokio::test]
    async fn open_circuit_never_invokes_the_operation() {
        let breaker = CircuitBreaker::new("test", quick_config(2, 60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invocations = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let count = invocations.clone();
            let result = breaker
                .execute(move || async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RecallError>(42)
                })
                .await;
            match result {
                Err(RecallError::CircuitOpen {
                    service,
                    failure_count,
                    ..
                }) => {
                    assert_eq!(service, "test");
                    assert_eq!(failure_count, 2);
                }
                other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
            }
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().rejected_calls, 5);
    }

    #[tokio::test]
    async fn probe_success_closes_and_resets() {
        let breaker = CircuitBreaker::new("test", quick_config(2, 20));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(30)).await;

        let result = breaker.execute(|| async { Ok::<_, RecallError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.stats().current_timeout, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn probe_failure_reopens_with_doubled_timeout() {
        let breaker = CircuitBreaker::new("test", quick_config(2, 20));
        fail(&breaker).await;
        fail(&breaker).await;

        sleep(Duration::from_millis(30)).await;
        fail(&breaker).await; // admitted as probe, fails

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.current_timeout, Duration::from_millis(40));

        // A second probe failure doubles again, capped at max_timeout
        sleep(Duration::from_millis(50)).await;
        fail(&breaker).await;
        assert_eq!(breaker.stats().current_timeout, Duration::from_millis(80));
    }

    #[tokio::test]
    async fn timeout_growth_is_capped() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            timeout_multiplier: 10.0,
            max_timeout: Duration::from_millis(25),
            enable_logging: false,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("test", config);
        fail(&breaker).await;

        sleep(Duration::from_millis(15)).await;
        fail(&breaker).await; // probe fails: 10ms * 10 capped at 25ms
        assert_eq!(breaker.stats().current_timeout, Duration::from_millis(25));
    }

    #[tokio::test]
    async fn second_concurrent_probe_is_rejected() {
        let breaker = Arc::new(CircuitBreaker::new("test", quick_config(1, 10)));
        fail(&breaker).await;
        sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, RecallError>(1)
                })
                .await
        });

        // Give the probe a chance to be admitted
        sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result = breaker.execute(|| async { Ok::<_, RecallError>(2) }).await;
        assert!(matches!(result, Err(RecallError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn excluded_errors_do_not_count() {
        let breaker = CircuitBreaker::new("test", quick_config(2, 100));

        for _ in 0..5 {
            let result = breaker
                .execute(|| async {
                    Err::<(), _>(RecallError::Validation {
                        field: "content".to_string(),
                        message: "empty".to_string(),
                    })
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new("test", quick_config(3, 100));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        let _ = breaker.execute(|| async { Ok::<_, RecallError>(()) }).await;
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_open_and_reset() {
        let breaker = CircuitBreaker::new("test", quick_config(3, 60_000));
        breaker.force_open("maintenance window");
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute(|| async { Ok::<_, RecallError>(()) }).await;
        assert!(matches!(result, Err(RecallError::CircuitOpen { .. })));

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let result = breaker.execute(|| async { Ok::<_, RecallError>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn operation_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            operation_timeout: Some(Duration::from_millis(10)),
            enable_logging: false,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("test", config);

        let result = breaker
            .execute(|| async {
                sleep(Duration::from_millis(100)).await;
                Ok::<_, RecallError>(())
            })
            .await;
        assert!(matches!(result, Err(RecallError::Timeout { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn execute_sync_shares_state_with_async_path() {
        let breaker = CircuitBreaker::new("test", quick_config(2, 60_000));

        for _ in 0..2 {
            let _ = breaker.execute_sync(|| Err::<(), _>(net_failure()));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute_sync(|| Ok::<_, RecallError>(5));
        assert!(matches!(result, Err(RecallError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::new(quick_config(1, 60_000));

        let a = registry.breaker("github");
        let b = registry.breaker("github");
        let other = registry.breaker("notion");

        let _ = a.execute(|| async { Err::<(), _>(net_failure()) }).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(other.state(), CircuitState::Closed);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);

        registry.reset_all();
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
