//! Configuration loading
//!
//! Settings are read from a TOML file with every field defaulted, so an
//! empty file (or no file at all) yields a working configuration. A small
//! set of `RECALL_*` environment variables can override the file for
//! deployment-time tuning. Durations use humantime syntax ("250ms", "1h").

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{RecallError, Result};
use crate::patterns::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub failover: FailoverSettings,
    pub cache: CacheSettings,
    pub transactions: TransactionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: None,
        }
    }
}

impl RetrySettings {
    /// Retry config using jittered exponential backoff over these bounds
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            strategy: BackoffStrategy::Jittered {
                base: self.base_delay,
                max: self.max_delay,
                multiplier: 2.0,
            },
            attempt_timeout: self.attempt_timeout,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    pub timeout_multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            timeout_multiplier: 2.0,
            max_timeout: Duration::from_secs(600),
            operation_timeout: None,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
            timeout_multiplier: self.timeout_multiplier,
            max_timeout: self.max_timeout,
            operation_timeout: self.operation_timeout,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    pub sync_queue_capacity: usize,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            sync_queue_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    pub log_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub recovery_age: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_age: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("transactions"),
            recovery_age: Duration::from_secs(3600),
            cleanup_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl RecallConfig {
    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RecallError::Configuration {
            component: "config file".to_string(),
            message: format!("failed to read {:?}: {}", path, e),
        })?;
        let mut config: RecallConfig =
            toml::from_str(&contents).map_err(|e| RecallError::Configuration {
                component: "config file".to_string(),
                message: format!("failed to parse {:?}: {}", path, e),
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a TOML file if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply `RECALL_*` environment variables on top of the loaded values
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32("RECALL_RETRY_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_secs("RECALL_RETRY_BASE_DELAY_SECS") {
            self.retry.base_delay = v;
        }
        if let Some(v) = env_u32("RECALL_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = env_secs("RECALL_BREAKER_RESET_TIMEOUT_SECS") {
            self.breaker.reset_timeout = v;
        }
        if let Some(v) = env_secs("RECALL_FAILOVER_HEALTH_CHECK_SECS") {
            self.failover.health_check_interval = v;
        }
        if let Some(v) = env_secs("RECALL_CACHE_TTL_SECS") {
            self.cache.ttl = v;
        }
        if let Ok(v) = std::env::var("RECALL_TRANSACTION_LOG_DIR") {
            self.transactions.log_dir = PathBuf::from(v);
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env_u32(name).map(|secs| Duration::from_secs(u64::from(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    fn defaults_are_complete() {
        let config = RecallConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.max_timeout, Duration::from_secs(600));
        assert_eq!(config.failover.sync_queue_capacity, 128);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.transactions.recovery_age, Duration::from_secs(3600));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: RecallConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: RecallConfig = toml::from_str(
            r#"
            [retry]
            max_retries = 7
            base_delay = "250ms"

            [breaker]
            failure_threshold = 3
            reset_timeout = "5s"

            [cache]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(5));
        assert!(!config.cache.enabled);
        assert_eq!(config.failover.sync_queue_capacity, 128);
    }

    #[test]
    fn settings_convert_to_pattern_configs() {
        let mut settings = RecallConfig::default();
        settings.retry.max_retries = 5;
        settings.breaker.failure_threshold = 2;

        let retry = settings.retry.to_retry_config();
        assert_eq!(retry.max_retries, 5);
        assert!(matches!(retry.strategy, BackoffStrategy::Jittered { .. }));

        let breaker = settings.breaker.to_breaker_config();
        assert_eq!(breaker.failure_threshold, 2);
        assert_eq!(breaker.timeout_multiplier, 2.0);
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence() {
        std::env::set_var("RECALL_RETRY_MAX_RETRIES", "9");
        std::env::set_var("RECALL_BREAKER_RESET_TIMEOUT_SECS", "120");

        let mut config = RecallConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(120));

        std::env::remove_var("RECALL_RETRY_MAX_RETRIES");
        std::env::remove_var("RECALL_BREAKER_RESET_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn invalid_env_values_are_ignored() {
        std::env::set_var("RECALL_RETRY_MAX_RETRIES", "lots");
        let mut config = RecallConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.retry.max_retries, 3);
        std::env::remove_var("RECALL_RETRY_MAX_RETRIES");
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = RecallConfig::default();
        config.breaker.max_timeout = Duration::from_secs(90);
        config.transactions.log_dir = PathBuf::from("/var/lib/recall/tx");

        let encoded = toml::to_string(&config).unwrap();
        let decoded: RecallConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.breaker.max_timeout, Duration::from_secs(90));
        assert_eq!(
            decoded.transactions.log_dir,
            PathBuf::from("/var/lib/recall/tx")
        );
    }
}
