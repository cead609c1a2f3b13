//! # Dependency Health Poller
//!
//! Periodically invokes registered dependency predicates through the same
//! monitored-call path as live traffic, so dependency checks show up in
//! call records, breaker state and health rows. A dependency that keeps
//! failing is escalated with its own alert, `Critical` for required
//! dependencies.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alerting::{Alert, METRIC_DEPENDENCY_UNAVAILABLE};
use crate::config::RetryPolicy;
use crate::logging::LogLevel;
use crate::monitor::{CallOptions, RemoteCallMonitor};
use crate::tasks::ScheduledTask;
use crate::types::{Error, ServiceType, Severity};

/// Endpoint name dependency checks are recorded under
pub const HEALTH_CHECK_ENDPOINT: &str = "health-check";
const HEALTH_CHECK_METHOD: &str = "CHECK";

/// Asynchronous predicate answering "is this dependency reachable"
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Last known state of one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub service_type: ServiceType,
    pub required: bool,
    /// `None` until the first check completes
    pub healthy: Option<bool>,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Dependency {
    check: HealthCheck,
    retry_policy: Option<RetryPolicy>,
    status: DependencyStatus,
    escalated: bool,
}

/// Registry of dependency checks, driven by [`RemoteCallMonitor`]
#[derive(Default)]
pub struct DependencyHealthPoller {
    dependencies: RwLock<BTreeMap<String, Dependency>>,
}

impl DependencyHealthPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a dependency check
    pub fn register<F, Fut>(
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
        let check: HealthCheck = Arc::new(move || check().boxed());
        let dependency = Dependency {
            check,
            retry_policy,
            status: DependencyStatus {
                name: name.to_string(),
                service_type,
                required,
                healthy: None,
                consecutive_failures: 0,
                last_checked: None,
                last_success: None,
                last_error: None,
            },
            escalated: false,
        };

        self.dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), dependency);

        info!(dependency = %name, required, "Dependency registered");
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn statuses(&self) -> Vec<DependencyStatus> {
        self.dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|d| d.status.clone())
            .collect()
    }

    /// Checks every dependency concurrently, each under the configured
    /// per-check timeout, and returns the updated statuses
    pub async fn poll_once(&self, monitor: &RemoteCallMonitor) -> Vec<DependencyStatus> {
        let timeout = monitor.config().dependency_check_timeout();

        let checks: Vec<(String, ServiceType, HealthCheck, Option<RetryPolicy>)> = self
            .dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, d)| {
                (
                    name.clone(),
                    d.status.service_type,
                    d.check.clone(),
                    d.retry_policy.clone(),
                )
            })
            .collect();

        let results = join_all(checks.into_iter().map(|(name, service_type, check, policy)| async move {
            let result = check_dependency(monitor, &name, service_type, check, policy, timeout).await;
            (name, result)
        }))
        .await;

        for (name, result) in results {
            if let Some(alert) = self.apply(&name, result, monitor) {
                monitor.raise_alert(alert);
            }
        }

        self.statuses()
    }

    // Folds one check result into the status; returns an escalation alert
    // the first time a failure streak reaches the threshold
    fn apply(&self, name: &str, result: Result<(), Error>, monitor: &RemoteCallMonitor) -> Option<Alert> {
        let threshold = monitor.config().alerts.consecutive_failures.max(1);
        let now = Utc::now();

        let mut dependencies = self.dependencies.write().unwrap_or_else(PoisonError::into_inner);
        // Deregistered while the check was running
        let dependency = dependencies.get_mut(name)?;
        let status = &mut dependency.status;
        status.last_checked = Some(now);

        match result {
            Ok(()) => {
                if status.healthy == Some(false) {
                    info!(
                        dependency = %name,
                        failures = status.consecutive_failures,
                        "Dependency recovered"
                    );
                    monitor_log(monitor, LogLevel::Info, "Dependency recovered", status);
                }
                status.healthy = Some(true);
                status.consecutive_failures = 0;
                status.last_success = Some(now);
                status.last_error = None;
                dependency.escalated = false;
                None
            }
            Err(error) => {
                status.healthy = Some(false);
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.last_error = Some(error.to_string());

                warn!(
                    dependency = %name,
                    required = status.required,
                    failures = status.consecutive_failures,
                    error = %error,
                    "Dependency check failed"
                );

                if status.consecutive_failures < threshold || dependency.escalated {
                    return None;
                }
                dependency.escalated = true;

                let severity = if status.required {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                monitor_log(monitor, LogLevel::Error, "Dependency unavailable", status);

                Some(Alert::new(
                    name,
                    METRIC_DEPENDENCY_UNAVAILABLE,
                    f64::from(status.consecutive_failures),
                    f64::from(threshold),
                    severity,
                ))
            }
        }
    }

    /// Polls on the configured interval until the returned task is shut down
    pub fn start(monitor: Arc<RemoteCallMonitor>, period: Duration) -> ScheduledTask {
        ScheduledTask::spawn("dependency-poller", period, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.poll_dependencies().await;
            }
        })
    }
}

async fn check_dependency(
    monitor: &RemoteCallMonitor,
    name: &str,
    service_type: ServiceType,
    check: HealthCheck,
    retry_policy: Option<RetryPolicy>,
    timeout: Duration,
) -> Result<(), Error> {
    let mut options = CallOptions::new().timeout(timeout).metadata("dependency_check", true);
    if let Some(policy) = retry_policy {
        options = options.retry_policy(policy);
    }

    monitor
        .monitored_call(
            name,
            service_type,
            HEALTH_CHECK_ENDPOINT,
            HEALTH_CHECK_METHOD,
            || {
                let check = check.clone();
                async move {
                    if check().await {
                        Ok(())
                    } else {
                        Err(Error::network("Dependency health check reported unavailable"))
                    }
                }
            },
            options,
        )
        .await
}

fn monitor_log(monitor: &RemoteCallMonitor, level: LogLevel, message: &str, status: &DependencyStatus) {
    monitor.log(
        level,
        "dependency-poller",
        message,
        serde_json::json!({
            "dependency": status.name,
            "service_type": status.service_type,
            "required": status.required,
            "consecutive_failures": status.consecutive_failures,
            "last_error": status.last_error,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::MemoryAlertDispatcher;
    use crate::config::{ConfigHandle, MonitoringConfig};
    use crate::logging::MemorySink;
    use crate::recorder::CallFilter;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn monitor() -> (RemoteCallMonitor, Arc<MemorySink>, Arc<MemoryAlertDispatcher>) {
        let mut config = MonitoringConfig::default();
        config.alerts.consecutive_failures = 2;
        config.circuit_breaker.failure_threshold = 100;
        let sink = Arc::new(MemorySink::new());
        let alerts = Arc::new(MemoryAlertDispatcher::new());
        (
            RemoteCallMonitor::with_collaborators(ConfigHandle::new(config), sink.clone(), alerts.clone()),
            sink,
            alerts,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_checks_are_recorded_as_calls() {
        let (monitor, _, _) = monitor();
        monitor.register_dependency("primary-db", ServiceType::Database, true, Some(RetryPolicy::no_retries()), || async {
            true
        });

        let statuses = monitor.poll_dependencies().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].healthy, Some(true));

        let calls = monitor.get_service_calls(&CallFilter::new().service_type(ServiceType::Database));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].endpoint, HEALTH_CHECK_ENDPOINT);
        assert!(calls[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_dependency_escalates_once_per_streak() {
        let (monitor, sink, alerts) = monitor();
        let up = Arc::new(AtomicBool::new(false));
        let flag = up.clone();
        monitor.register_dependency(
            "ai-backend",
            ServiceType::External,
            true,
            Some(RetryPolicy::no_retries()),
            move || {
                let flag = flag.clone();
                async move { flag.load(Ordering::SeqCst) }
            },
        );

        monitor.poll_dependencies().await;
        assert!(alerts.alerts_for_metric(METRIC_DEPENDENCY_UNAVAILABLE).is_empty());

        monitor.poll_dependencies().await;
        monitor.poll_dependencies().await;
        let escalations = alerts.alerts_for_metric(METRIC_DEPENDENCY_UNAVAILABLE);
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].severity, Severity::Critical);
        assert_eq!(escalations[0].service_name, "ai-backend");

        up.store(true, Ordering::SeqCst);
        let statuses = monitor.poll_dependencies().await;
        assert_eq!(statuses[0].consecutive_failures, 0);
        assert_eq!(sink.events_with_message("Dependency recovered").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_dependency_warns() {
        let (monitor, _, alerts) = monitor();
        monitor.register_dependency("cache", ServiceType::External, false, Some(RetryPolicy::no_retries()), || async {
            false
        });

        monitor.poll_dependencies().await;
        monitor.poll_dependencies().await;

        let escalations = alerts.alerts_for_metric(METRIC_DEPENDENCY_UNAVAILABLE);
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_check_times_out() {
        let (monitor, _, _) = monitor();
        monitor.register_dependency("stuck", ServiceType::External, false, Some(RetryPolicy::no_retries()), || async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            true
        });

        let statuses = monitor.poll_dependencies().await;
        assert_eq!(statuses[0].healthy, Some(false));
        assert!(statuses[0].last_error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_drives_polls() {
        let (monitor, _, _) = monitor();
        let monitor = Arc::new(monitor);
        monitor.register_dependency("db", ServiceType::Database, true, Some(RetryPolicy::no_retries()), || async {
            true
        });

        let task = DependencyHealthPoller::start(monitor.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(185)).await;
        task.shutdown().await;

        let checks = monitor.get_service_calls(&CallFilter::new().service("db"));
        assert_eq!(checks.len(), 3);
    }
}
