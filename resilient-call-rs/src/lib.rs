//! # Resilient Remote Calls
//!
//! Safe invocation of external services (webhooks, third-party APIs,
//! databases) under partial failure, with per-service health tracking.
//!
//! ## Features
//!
//! - Classified errors with explicit kinds driving retry eligibility
//! - Per-service circuit breakers with an atomic single-probe half-open state
//! - Exponential backoff with jitter
//! - Bounded in-memory call and retry history
//! - Rolling endpoint and service health with p95 response times
//! - Alert thresholds handed to a pluggable dispatcher
//! - Periodic dependency health polling
//!
//! ```no_run
//! use resilient_call::{CallOptions, MonitoringConfig, RemoteCallMonitor, ServiceType};
//!
//! # async fn run() -> resilient_call::Result<()> {
//! let monitor = RemoteCallMonitor::new(MonitoringConfig::load(None)?);
//! let total: u64 = monitor
//!     .monitored_call(
//!         "billing",
//!         ServiceType::Api,
//!         "/invoices/total",
//!         "GET",
//!         || async { Ok::<_, resilient_call::Error>(42) },
//!         CallOptions::new(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod alerting;
pub mod analytics;
pub mod circuit_breaker;
pub mod config;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod poller;
pub mod recorder;
pub mod retry;
pub mod tasks;
pub mod types;
pub mod webhook;

// Re-export commonly used types
pub use alerting::{Alert, AlertDispatcher, AlertLatch, TracingAlertDispatcher};
pub use analytics::CallAnalytics;
pub use circuit_breaker::{
    Admission, CallPermit, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState, ProbeTicket,
};
pub use config::{ConfigError, ConfigHandle, MonitoringConfig, RetryPolicy};
pub use health::{EndpointHealth, HealthStatus, ServiceHealth};
pub use logging::{generate_correlation_id, init_logging, LoggingConfig, ObservabilitySink, TracingSink};
pub use monitor::{CallOptions, RemoteCallMonitor};
pub use poller::DependencyStatus;
pub use recorder::{CallFilter, RetryAttempt, RetryFilter, ServiceCall};
pub use tasks::ScheduledTask;
pub use types::{Error, ErrorKind, Result, ServiceType, Severity};
pub use webhook::WebhookClient;

/// Initializes logging and loads configuration from the environment
pub fn init(config_path: Option<&str>) -> Result<MonitoringConfig> {
    init_logging(None)?;
    Ok(MonitoringConfig::load(config_path)?)
}
