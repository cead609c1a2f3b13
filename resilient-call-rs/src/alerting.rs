//! # Alert Thresholds
//!
//! Threshold evaluation over endpoint health and the boundary to the
//! external alert-dispatch collaborator. Dispatch is fire-and-forget: a
//! dispatcher failure is logged and never propagates into the call that
//! triggered it.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AlertThresholds;
use crate::health::EndpointHealth;
use crate::types::{Result, Severity};

/// Metric names carried by alerts
pub const METRIC_ERROR_RATE: &str = "error_rate";
pub const METRIC_RESPONSE_TIME: &str = "response_time";
pub const METRIC_CONSECUTIVE_FAILURES: &str = "consecutive_failures";
pub const METRIC_DEPENDENCY_UNAVAILABLE: &str = "dependency_unavailable";

/// A threshold breach handed to the alert dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub service_name: String,
    pub metric: String,
    pub current_value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub endpoint: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new<S, M>(service_name: S, metric: M, current_value: f64, threshold: f64, severity: Severity) -> Self
    where
        S: Into<String>,
        M: Into<String>,
    {
        Self {
            service_name: service_name.into(),
            metric: metric.into(),
            current_value,
            threshold,
            severity,
            endpoint: None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// External alert-dispatch collaborator.
///
/// Implementations that need I/O must spawn it; `dispatch` is called inline
/// after a call outcome is recorded.
pub trait AlertDispatcher: Send + Sync {
    fn dispatch(&self, alert: &Alert) -> Result<()>;
}

/// Dispatcher that only logs alerts
#[derive(Debug, Default, Clone)]
pub struct TracingAlertDispatcher;

impl AlertDispatcher for TracingAlertDispatcher {
    fn dispatch(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Info => tracing::info!(
                alert = true,
                service = %alert.service_name,
                metric = %alert.metric,
                current = alert.current_value,
                threshold = alert.threshold,
                "Alert triggered"
            ),
            Severity::Warning => tracing::warn!(
                alert = true,
                service = %alert.service_name,
                metric = %alert.metric,
                current = alert.current_value,
                threshold = alert.threshold,
                "Alert triggered"
            ),
            Severity::Major | Severity::Critical => tracing::error!(
                alert = true,
                severity = %alert.severity,
                service = %alert.service_name,
                metric = %alert.metric,
                current = alert.current_value,
                threshold = alert.threshold,
                "Alert triggered"
            ),
        }
        Ok(())
    }
}

/// Dispatcher that keeps alerts in memory
#[derive(Debug, Default)]
pub struct MemoryAlertDispatcher {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn alerts_for_metric(&self, metric: &str) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|alert| alert.metric == metric)
            .collect()
    }
}

impl AlertDispatcher for MemoryAlertDispatcher {
    fn dispatch(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}

/// Alerts for every threshold an endpoint currently breaches
pub fn evaluate_endpoint(
    service_name: &str,
    endpoint: &EndpointHealth,
    thresholds: &AlertThresholds,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if endpoint.total_calls > 0 && endpoint.error_rate > thresholds.error_rate {
        alerts.push(
            Alert::new(
                service_name,
                METRIC_ERROR_RATE,
                endpoint.error_rate,
                thresholds.error_rate,
                Severity::Warning,
            )
            .endpoint(endpoint.endpoint.clone()),
        );
    }

    if endpoint.avg_response_time_ms > thresholds.response_time_ms {
        alerts.push(
            Alert::new(
                service_name,
                METRIC_RESPONSE_TIME,
                endpoint.avg_response_time_ms,
                thresholds.response_time_ms,
                Severity::Warning,
            )
            .endpoint(endpoint.endpoint.clone()),
        );
    }

    if thresholds.consecutive_failures > 0
        && endpoint.consecutive_failures >= thresholds.consecutive_failures
    {
        alerts.push(
            Alert::new(
                service_name,
                METRIC_CONSECUTIVE_FAILURES,
                f64::from(endpoint.consecutive_failures),
                f64::from(thresholds.consecutive_failures),
                Severity::Major,
            )
            .endpoint(endpoint.endpoint.clone()),
        );
    }

    alerts
}

/// Thresholds currently breached, per endpoint and metric.
///
/// A breach is reported once, when first crossed; the metric re-arms once
/// the endpoint drops back under its threshold.
#[derive(Debug, Default)]
pub struct AlertLatch {
    active: Mutex<HashSet<String>>,
}

impl AlertLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrows the breaches of one endpoint (`scope`) to the newly crossed ones
    pub fn crossed(&self, scope: &str, breaches: Vec<Alert>) -> Vec<Alert> {
        let prefix = format!("{}|", scope);
        let breached: HashSet<String> = breaches
            .iter()
            .map(|alert| format!("{}{}", prefix, alert.metric))
            .collect();

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|key| !key.starts_with(&prefix) || breached.contains(key));

        breaches
            .into_iter()
            .filter(|alert| active.insert(format!("{}{}", prefix, alert.metric)))
            .collect()
    }

    /// Re-arms every metric of scopes starting with `scope_prefix`
    pub fn forget(&self, scope_prefix: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key| !key.starts_with(scope_prefix));
    }
}

/// Hands an alert to the dispatcher, swallowing and logging any failure
pub fn fire_and_forget(dispatcher: &dyn AlertDispatcher, alert: &Alert) {
    counter!("resilient_call.alerts", 1, "metric" => alert.metric.clone());

    if let Err(e) = dispatcher.dispatch(alert) {
        warn!(
            service = %alert.service_name,
            metric = %alert.metric,
            error = %e,
            "Alert dispatch failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::types::Error;

    fn endpoint(error_rate: f64, avg: f64, consecutive: u32) -> EndpointHealth {
        EndpointHealth {
            endpoint: "/hook".to_string(),
            method: "POST".to_string(),
            status: HealthStatus::Healthy,
            total_calls: 10,
            error_rate,
            avg_response_time_ms: avg,
            uptime_percentage: 100.0 - error_rate,
            consecutive_failures: consecutive,
            last_success: None,
            last_failure: None,
            last_checked: None,
        }
    }

    #[test]
    fn test_no_alerts_within_thresholds() {
        let alerts = evaluate_endpoint("svc", &endpoint(5.0, 100.0, 0), &AlertThresholds::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_each_threshold_breach() {
        let thresholds = AlertThresholds {
            error_rate: 10.0,
            response_time_ms: 500.0,
            consecutive_failures: 3,
        };
        let alerts = evaluate_endpoint("svc", &endpoint(20.0, 900.0, 3), &thresholds);

        let metrics: Vec<_> = alerts.iter().map(|a| a.metric.as_str()).collect();
        assert_eq!(
            metrics,
            vec![METRIC_ERROR_RATE, METRIC_RESPONSE_TIME, METRIC_CONSECUTIVE_FAILURES]
        );
        assert_eq!(alerts[0].current_value, 20.0);
        assert_eq!(alerts[2].severity, Severity::Major);
        assert_eq!(alerts[1].endpoint.as_deref(), Some("/hook"));
    }

    #[test]
    fn test_latch_reports_each_breach_once() {
        let thresholds = AlertThresholds {
            error_rate: 10.0,
            response_time_ms: 500.0,
            consecutive_failures: 3,
        };
        let latch = AlertLatch::new();
        let scope = "api:svc|GET /hook";

        let first = latch.crossed(scope, evaluate_endpoint("svc", &endpoint(20.0, 100.0, 1), &thresholds));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].metric, METRIC_ERROR_RATE);

        // Still breached, and a second metric crosses
        let second = latch.crossed(scope, evaluate_endpoint("svc", &endpoint(25.0, 900.0, 2), &thresholds));
        let metrics: Vec<_> = second.iter().map(|a| a.metric.as_str()).collect();
        assert_eq!(metrics, vec![METRIC_RESPONSE_TIME]);

        // Recovery re-arms both
        assert!(latch
            .crossed(scope, evaluate_endpoint("svc", &endpoint(5.0, 100.0, 0), &thresholds))
            .is_empty());
        assert_eq!(
            latch
                .crossed(scope, evaluate_endpoint("svc", &endpoint(20.0, 900.0, 0), &thresholds))
                .len(),
            2
        );

        // Other endpoints are tracked separately
        let other = latch.crossed("api:svc|POST /hook", evaluate_endpoint("svc", &endpoint(20.0, 100.0, 0), &thresholds));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_latch_forget_rearms_service() {
        let latch = AlertLatch::new();
        let thresholds = AlertThresholds::default();
        let breach = || evaluate_endpoint("svc", &endpoint(50.0, 100.0, 0), &thresholds);

        assert_eq!(latch.crossed("api:svc|GET /a", breach()).len(), 1);
        assert!(latch.crossed("api:svc|GET /a", breach()).is_empty());

        latch.forget("api:svc|");
        assert_eq!(latch.crossed("api:svc|GET /a", breach()).len(), 1);
    }

    struct FailingDispatcher;

    impl AlertDispatcher for FailingDispatcher {
        fn dispatch(&self, _alert: &Alert) -> Result<()> {
            Err(Error::network("alert channel unreachable"))
        }
    }

    #[test]
    fn test_dispatch_failure_is_swallowed() {
        let alert = Alert::new("svc", METRIC_ERROR_RATE, 50.0, 10.0, Severity::Warning);
        fire_and_forget(&FailingDispatcher, &alert);

        let memory = MemoryAlertDispatcher::new();
        fire_and_forget(&memory, &alert);
        assert_eq!(memory.alerts_for_metric(METRIC_ERROR_RATE).len(), 1);
    }
}
