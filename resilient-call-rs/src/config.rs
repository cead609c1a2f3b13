//! # Monitoring Configuration
//!
//! Retry, breaker, alert and retention policy for the remote-call layer.
//! Loaded once at startup from defaults, an optional file and
//! `RESILIENT_CALL__*` environment variables, then hot-swappable at runtime
//! through [`ConfigHandle`].

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "RESILIENT_CALL";

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Exponential backoff policy for retryable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker policy, applied to every service id independently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive terminal failures that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe
    pub reset_timeout_ms: u64,
    /// A failure further than this from the previous one restarts the count
    pub monitoring_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            monitoring_window_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

/// Thresholds that raise alerts when breached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Error rate in percent (0-100)
    pub error_rate: f64,
    /// Average response time in milliseconds
    pub response_time_ms: f64,
    /// Consecutive failures on one endpoint
    pub consecutive_failures: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 10.0,
            response_time_ms: 5_000.0,
            consecutive_failures: 3,
        }
    }
}

/// Retention of recorded calls and retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Ring buffer capacity for service calls
    pub max_calls: usize,
    /// Ring buffer capacity for retry attempts
    pub max_retry_attempts: usize,
    /// Records older than this are dropped by the cleanup sweep
    pub max_age_secs: u64,
    /// Period of the cleanup sweep
    pub cleanup_interval_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_calls: 10_000,
            max_retry_attempts: 10_000,
            max_age_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
        }
    }
}

impl RecorderConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Complete configuration of the remote-call layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub alerts: AlertThresholds,
    pub recorder: RecorderConfig,
    /// Interval of the dependency health poller
    pub health_check_interval_secs: u64,
    /// Per-check timeout of the dependency health poller
    pub dependency_check_timeout_ms: u64,
    /// Trailing window the health tracker computes metrics over
    pub health_window_secs: u64,
    /// Response-time samples kept per service for percentiles
    pub percentile_sample_size: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            alerts: AlertThresholds::default(),
            recorder: RecorderConfig::default(),
            health_check_interval_secs: 60,
            dependency_check_timeout_ms: 10_000,
            health_window_secs: 60 * 60,
            percentile_sample_size: 100,
        }
    }
}

impl MonitoringConfig {
    /// Loads configuration from defaults, an optional file and the environment.
    ///
    /// A `.env` file in the working directory is read first when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: MonitoringConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Rejects settings that would disable the layer's invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be a finite value >= 1.0".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        if self.recorder.max_calls == 0 || self.recorder.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid("recorder capacities must be non-zero".into()));
        }
        if self.percentile_sample_size == 0 {
            return Err(ConfigError::Invalid("percentile_sample_size must be non-zero".into()));
        }
        if self.health_check_interval_secs == 0 || self.recorder.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid("background intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn dependency_check_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_check_timeout_ms)
    }

    pub fn health_window(&self) -> Duration {
        Duration::from_secs(self.health_window_secs)
    }
}

/// Shared, atomically replaceable configuration
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<MonitoringConfig>>,
}

impl ConfigHandle {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Snapshot of the configuration in effect right now
    pub fn current(&self) -> Arc<MonitoringConfig> {
        self.inner.load_full()
    }

    /// Validates and swaps in a new configuration
    pub fn replace(&self, config: MonitoringConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        info!("Monitoring configuration replaced");
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}
