//! # Remote Call Monitor
//!
//! Façade over the breaker registry, retry policy, call recorder and health
//! tracker. Every outbound call goes through [`RemoteCallMonitor::monitored_call`]:
//!
//! 1. the breaker admits, rejects or makes the caller the half-open probe
//! 2. the operation runs per attempt under an optional timeout and the
//!    caller's cancellation token
//! 3. retryable failures back off and retry until the policy is exhausted
//! 4. the terminal outcome is recorded and fed to the breaker, the health
//!    tracker and the alert thresholds

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::alerting::{evaluate_endpoint, fire_and_forget, Alert, AlertDispatcher, AlertLatch, TracingAlertDispatcher};
use crate::analytics::CallAnalytics;
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState};
use crate::config::{ConfigError, ConfigHandle, MonitoringConfig, RetryPolicy};
use crate::health::{HealthTracker, ServiceHealth};
use crate::logging::{generate_correlation_id, LogLevel, ObservabilitySink, TracingSink};
use crate::poller::{DependencyHealthPoller, DependencyStatus};
use crate::recorder::{CallFilter, CallRecorder, RetryAttempt, RetryFilter, ServiceCall};
use crate::retry::{compute_delay, should_retry};
use crate::tasks::ScheduledTask;
use crate::types::{service_id, Error, ErrorKind, Result, ServiceType};

/// Per-call options for [`RemoteCallMonitor::monitored_call`]
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for each attempt; every retry gets a fresh budget
    pub timeout: Option<Duration>,
    /// Generated when absent
    pub correlation_id: Option<String>,
    /// Overrides the configured retry policy
    pub retry_policy: Option<RetryPolicy>,
    /// Attached to every recorded call
    pub metadata: HashMap<String, serde_json::Value>,
    /// Aborts the in-flight attempt and any pending retry delay
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), value);
        }
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

// Identity of one logical call, shared by every record it produces
struct CallContext<'a> {
    service_name: &'a str,
    service_type: ServiceType,
    service_id: String,
    endpoint: &'a str,
    method: &'a str,
    correlation_id: String,
    metadata: &'a HashMap<String, serde_json::Value>,
}

impl CallContext<'_> {
    fn success(&self, elapsed: Duration, retry_count: u32) -> ServiceCall {
        ServiceCall::success(
            self.correlation_id.as_str(),
            self.service_name,
            self.service_type,
            self.endpoint,
            self.method,
            elapsed,
        )
        .retry_count(retry_count)
        .metadata(self.metadata.clone())
    }

    fn failure(&self, elapsed: Duration, retry_count: u32, error: &Error) -> ServiceCall {
        ServiceCall::failure(
            self.correlation_id.as_str(),
            self.service_name,
            self.service_type,
            self.endpoint,
            self.method,
            elapsed,
            error,
        )
        .retry_count(retry_count)
        .metadata(self.metadata.clone())
    }

    fn annotate(&self, mut error: Error) -> Error {
        if error.service.is_none() {
            error.service = Some(self.service_id.clone());
        }
        if error.endpoint.is_none() {
            error.endpoint = Some(self.endpoint.to_string());
        }
        if error.correlation_id.is_none() {
            error.correlation_id = Some(self.correlation_id.clone());
        }
        error
    }
}

/// Resilient remote-call layer for one process
pub struct RemoteCallMonitor {
    config: ConfigHandle,
    breakers: CircuitBreakerRegistry,
    recorder: CallRecorder,
    health: HealthTracker,
    dependencies: DependencyHealthPoller,
    alert_latch: AlertLatch,
    dispatcher: Arc<dyn AlertDispatcher>,
    sink: Arc<dyn ObservabilitySink>,
}

impl RemoteCallMonitor {
    /// Monitor that logs through `tracing` and dispatches alerts as log events
    pub fn new(config: MonitoringConfig) -> Self {
        Self::with_collaborators(
            ConfigHandle::new(config),
            Arc::new(TracingSink),
            Arc::new(TracingAlertDispatcher),
        )
    }

    pub fn with_collaborators(
        config: ConfigHandle,
        sink: Arc<dyn ObservabilitySink>,
        dispatcher: Arc<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(config.clone(), sink.clone()),
            recorder: CallRecorder::new(config.clone(), sink.clone()),
            health: HealthTracker::new(config.clone()),
            dependencies: DependencyHealthPoller::new(),
            alert_latch: AlertLatch::new(),
            config,
            dispatcher,
            sink,
        }
    }

    /// Creates the breaker and health rows of a service up front
    pub fn register_service<I, E, M>(&self, service_name: &str, service_type: ServiceType, endpoints: I)
    where
        I: IntoIterator<Item = (E, M)>,
        E: Into<String>,
        M: Into<String>,
    {
        let id = service_id(service_type, service_name);
        let endpoints: Vec<(String, String)> = endpoints
            .into_iter()
            .map(|(endpoint, method)| (endpoint.into(), method.into()))
            .collect();

        self.breakers.register(&id);
        self.health.register_service(service_name, service_type, &endpoints);

        self.sink.log(
            LogLevel::Info,
            "monitor",
            "Service registered",
            serde_json::json!({ "service_id": id, "endpoints": endpoints.len() }),
            None,
        );
    }

    /// Drops the breaker and every health row of a service
    pub fn deregister_service(&self, service_name: &str, service_type: ServiceType) -> bool {
        let id = service_id(service_type, service_name);
        let had_breaker = self.breakers.deregister(&id);
        let had_health = self.health.deregister_service(&id);
        self.alert_latch.forget(&format!("{}|", id));
        had_breaker || had_health
    }

    /// Registers a hard or soft dependency checked by the dependency poller
    pub fn register_dependency<F, Fut>(
        &self,
        name: &str,
        service_type: ServiceType,
        required: bool,
        retry_policy: Option<RetryPolicy>,
        check: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.dependencies
            .register(name, service_type, required, retry_policy, check);
    }

    /// Runs `operation` under the breaker, retry policy and timeout of the
    /// service, recording every outcome.
    ///
    /// Returns the operation's value, or the single classified error of the
    /// last attempt. Intermediate failures are only visible through
    /// [`Self::get_retry_attempts`].
    pub async fn monitored_call<T, F, Fut>(
        &self,
        service_name: &str,
        service_type: ServiceType,
        endpoint: &str,
        method: &str,
        operation: F,
        options: CallOptions,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = CallContext {
            service_name,
            service_type,
            service_id: service_id(service_type, service_name),
            endpoint,
            method,
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_else(generate_correlation_id),
            metadata: &options.metadata,
        };

        let span = info_span!(
            "monitored_call",
            service = %ctx.service_id,
            endpoint = %endpoint,
            method = %method,
            correlation_id = %ctx.correlation_id
        );

        self.run(&ctx, operation, &options).instrument(span).await
    }

    async fn run<T, F, Fut>(&self, ctx: &CallContext<'_>, mut operation: F, options: &CallOptions) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cfg = self.config.current();
        let policy = options.retry_policy.as_ref().unwrap_or(&cfg.retry);
        let cancel = options.cancellation.as_ref();

        // Dropping the permit before an outcome is recorded (cancellation,
        // a caller-side timeout, an aborted task) frees a held probe slot.
        let permit = match self.breakers.permit(&ctx.service_id) {
            Ok(permit) => permit,
            Err(retry_after) => {
                counter!("resilient_call.circuit_open_rejections", 1, "service_type" => ctx.service_type.as_str());
                let error = ctx.annotate(
                    Error::circuit_open(format!("Circuit breaker open for {}", ctx.service_id))
                        .context("retry_after_ms", retry_after.as_millis() as u64),
                );
                self.recorder.record_call(ctx.failure(Duration::ZERO, 0, &error));
                return Err(error);
            }
        };

        let mut attempt: u32 = 1;
        loop {
            let started = Instant::now();
            let outcome = run_attempt(operation(), options.timeout, cancel).await;
            let elapsed = started.elapsed();
            let retry_count = attempt - 1;

            let error = match outcome {
                Ok(value) => {
                    let call = ctx.success(elapsed, retry_count);
                    permit.record(true);
                    self.finish(ctx, call);
                    return Ok(value);
                }
                Err(error) => ctx.annotate(error),
            };

            if error.kind == ErrorKind::Cancelled {
                return Err(self.cancelled(ctx, elapsed, retry_count, error));
            }

            if !should_retry(&error, attempt, policy) {
                debug!(attempt, error = %error, "Call failed terminally");
                let call = ctx.failure(elapsed, retry_count, &error);
                permit.record(false);
                self.finish(ctx, call);
                return Err(error);
            }

            let delay = compute_delay(attempt, policy);
            self.recorder.record_retry(RetryAttempt {
                correlation_id: ctx.correlation_id.clone(),
                service_name: ctx.service_name.to_string(),
                endpoint: ctx.endpoint.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                success: false,
                error_kind: Some(error.kind),
                error: Some(error.message.clone()),
                timestamp: chrono::Utc::now(),
            });

            if sleep_or_cancel(delay, cancel).await {
                let error = ctx.annotate(Error::cancelled("Call cancelled during retry backoff"));
                return Err(self.cancelled(ctx, elapsed, retry_count, error));
            }

            attempt += 1;
        }
    }

    // Records the terminal outcome, folds it into health and raises alerts
    // for thresholds the endpoint just crossed
    fn finish(&self, ctx: &CallContext<'_>, call: ServiceCall) {
        let cfg = self.config.current();
        let endpoint_health = self.health.record(&call);
        self.recorder.record_call(call);

        let scope = format!("{}|{} {}", ctx.service_id, ctx.method, ctx.endpoint);
        let breaches = evaluate_endpoint(ctx.service_name, &endpoint_health, &cfg.alerts);
        for alert in self.alert_latch.crossed(&scope, breaches) {
            self.raise_alert(alert.correlation_id(ctx.correlation_id.as_str()));
        }
    }

    fn cancelled(
        &self,
        ctx: &CallContext<'_>,
        elapsed: Duration,
        retry_count: u32,
        error: Error,
    ) -> Error {
        debug!(retry_count, "Call cancelled");
        self.recorder.record_call(ctx.failure(elapsed, retry_count, &error));
        error
    }

    /// Hands an alert to the dispatcher and the observability sink
    pub(crate) fn raise_alert(&self, alert: Alert) {
        self.sink.log(
            LogLevel::Warn,
            "alerting",
            "Alert threshold breached",
            serde_json::json!({
                "service_name": alert.service_name,
                "metric": alert.metric,
                "current_value": alert.current_value,
                "threshold": alert.threshold,
                "severity": alert.severity,
                "endpoint": alert.endpoint,
            }),
            alert.correlation_id.as_deref(),
        );
        fire_and_forget(self.dispatcher.as_ref(), &alert);
    }

    pub(crate) fn log(&self, level: LogLevel, source: &str, message: &str, attributes: serde_json::Value) {
        self.sink.log(level, source, message, attributes, None);
    }

    /// Health of one service (by name or `type:name` id), or all services
    pub fn get_service_health(&self, name: Option<&str>) -> Vec<ServiceHealth> {
        self.health.service_health(name)
    }

    pub fn get_service_calls(&self, filter: &CallFilter) -> Vec<ServiceCall> {
        self.recorder.calls(filter)
    }

    pub fn get_retry_attempts(&self, filter: &RetryFilter) -> Vec<RetryAttempt> {
        self.recorder.retries(filter)
    }

    /// Aggregates over the last `window_hours` of recorded traffic
    pub fn get_analytics(&self, service_name: Option<&str>, window_hours: u32) -> CallAnalytics {
        let window = Duration::from_secs(u64::from(window_hours) * 3_600);

        let mut calls = CallFilter::new().within(window);
        let mut retries = RetryFilter::new();
        retries.since = calls.since;
        if let Some(name) = service_name {
            calls = calls.service(name);
            retries = retries.service(name);
        }

        CallAnalytics::compute(
            service_name,
            window_hours,
            &self.recorder.calls(&calls),
            &self.recorder.retries(&retries),
        )
    }

    pub fn breaker_state(&self, service_name: &str, service_type: ServiceType) -> CircuitState {
        self.breakers.state(&service_id(service_type, service_name))
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn reset_breaker(&self, service_name: &str, service_type: ServiceType) {
        self.breakers.reset(&service_id(service_type, service_name));
    }

    /// Validates and hot-swaps the configuration
    pub fn update_config(&self, config: MonitoringConfig) -> std::result::Result<(), ConfigError> {
        self.config.replace(config)
    }

    pub fn config(&self) -> Arc<MonitoringConfig> {
        self.config.current()
    }

    /// Drops records older than the configured maximum age
    pub fn cleanup(&self) -> usize {
        let max_age = self.config.current().recorder.max_age();
        self.recorder.evict_expired(max_age)
    }

    /// Runs one round of dependency checks
    pub async fn poll_dependencies(&self) -> Vec<DependencyStatus> {
        self.dependencies.poll_once(self).await
    }

    pub fn dependency_statuses(&self) -> Vec<DependencyStatus> {
        self.dependencies.statuses()
    }

    /// Starts the recorder cleanup sweep and the dependency poller.
    ///
    /// Intervals are read once here; a config swap takes effect for them on
    /// the next start.
    pub fn start_background_tasks(self: &Arc<Self>) -> Vec<ScheduledTask> {
        let cfg = self.config.current();

        let monitor = Arc::clone(self);
        let cleanup = ScheduledTask::spawn("recorder-cleanup", cfg.recorder.cleanup_interval(), move || {
            let monitor = Arc::clone(&monitor);
            async move {
                let removed = monitor.cleanup();
                if removed > 0 {
                    debug!(removed, "Recorder cleanup sweep finished");
                }
            }
        });

        vec![cleanup, DependencyHealthPoller::start(Arc::clone(self), cfg.health_check_interval())]
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }
}

impl std::fmt::Debug for RemoteCallMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallMonitor")
            .field("breakers", &self.breakers)
            .field("calls", &self.recorder.len())
            .finish()
    }
}

/// Awaits one attempt, racing it against the timeout and the cancellation
/// token. Losing the race drops the operation's future, which cancels it.
async fn run_attempt<T, Fut>(
    attempt: Fut,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let timed = async move {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Attempt timed out");
                    Err(Error::timeout(format!(
                        "Operation timed out after {}ms",
                        limit.as_millis()
                    )))
                }
            },
            None => attempt.await,
        }
    };

    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::cancelled("Call cancelled by caller")),
                result = timed => result,
            }
        }
        None => timed.await,
    }
}

/// Sleeps for `delay`; true when the token fired first
async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}
