//! # Health Tracker
//!
//! Per-endpoint and per-service health derived from the calls recorded
//! within a trailing window. Updated synchronously after every recorded
//! call; read on demand.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};

use crate::config::ConfigHandle;
use crate::recorder::{cutoff, ServiceCall};
use crate::types::{service_id, ServiceType};

/// Health status of an endpoint or service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last outcome succeeded within the response-time threshold
    Healthy,
    /// Succeeding, but slower than the response-time threshold
    Degraded,
    /// Last outcome failed
    Down,
    /// No calls observed yet
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Down => write!(f, "DOWN"),
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Health of one endpoint+method of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub method: String,
    pub status: HealthStatus,
    /// Calls inside the trailing window
    pub total_calls: u64,
    /// Percent of windowed calls that failed
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub uptime_percentage: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Aggregated health of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_id: String,
    pub service_name: String,
    pub service_type: ServiceType,
    pub status: HealthStatus,
    pub total_calls: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub uptime_percentage: f64,
    pub p95_response_time_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub endpoints: Vec<EndpointHealth>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    response_time_ms: u64,
    success: bool,
}

#[derive(Debug, Default)]
struct EndpointState {
    window: VecDeque<Sample>,
    last_outcome: Option<bool>,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_checked: Option<DateTime<Utc>>,
}

impl EndpointState {
    fn prune(&mut self, since: Option<DateTime<Utc>>, capacity: usize) {
        if let Some(since) = since {
            while self.window.front().map_or(false, |s| s.timestamp < since) {
                self.window.pop_front();
            }
        }
        while self.window.len() > capacity {
            self.window.pop_front();
        }
    }

    fn snapshot(
        &self,
        endpoint: &str,
        method: &str,
        since: Option<DateTime<Utc>>,
        response_time_threshold_ms: f64,
    ) -> EndpointHealth {
        let stats = WindowStats::over(self.window.iter().filter(|s| since.map_or(true, |t| s.timestamp >= t)));

        let status = match self.last_outcome {
            None => HealthStatus::Unknown,
            Some(false) => HealthStatus::Down,
            Some(true) if stats.avg_response_time_ms > response_time_threshold_ms => HealthStatus::Degraded,
            Some(true) => HealthStatus::Healthy,
        };

        EndpointHealth {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status,
            total_calls: stats.total,
            error_rate: stats.error_rate(),
            avg_response_time_ms: stats.avg_response_time_ms,
            uptime_percentage: stats.uptime_percentage(),
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_failure: self.last_failure,
            last_checked: self.last_checked,
        }
    }
}

#[derive(Debug, Default)]
struct WindowStats {
    total: u64,
    failed: u64,
    avg_response_time_ms: f64,
}

impl WindowStats {
    fn over<'a>(samples: impl Iterator<Item = &'a Sample>) -> Self {
        let mut stats = WindowStats::default();
        let mut response_sum = 0u128;
        for sample in samples {
            stats.total += 1;
            if !sample.success {
                stats.failed += 1;
            }
            response_sum += u128::from(sample.response_time_ms);
        }
        if stats.total > 0 {
            stats.avg_response_time_ms = response_sum as f64 / stats.total as f64;
        }
        stats
    }

    fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64 * 100.0
        }
    }

    fn uptime_percentage(&self) -> f64 {
        100.0 - self.error_rate()
    }
}

#[derive(Debug)]
struct ServiceState {
    service_name: String,
    service_type: ServiceType,
    // Keyed by (endpoint, method); BTreeMap keeps snapshots in a stable order
    endpoints: BTreeMap<(String, String), EndpointState>,
    samples: VecDeque<u64>,
    last_checked: Option<DateTime<Utc>>,
}

impl ServiceState {
    fn new(service_name: &str, service_type: ServiceType) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_type,
            endpoints: BTreeMap::new(),
            samples: VecDeque::new(),
            last_checked: None,
        }
    }

    fn snapshot(&self, service_id: &str, since: Option<DateTime<Utc>>, threshold_ms: f64) -> ServiceHealth {
        let endpoints: Vec<EndpointHealth> = self
            .endpoints
            .iter()
            .map(|((endpoint, method), state)| state.snapshot(endpoint, method, since, threshold_ms))
            .collect();

        let stats = WindowStats::over(
            self.endpoints
                .values()
                .flat_map(|e| e.window.iter())
                .filter(|s| since.map_or(true, |t| s.timestamp >= t)),
        );

        let samples: Vec<u64> = self.samples.iter().copied().collect();

        ServiceHealth {
            service_id: service_id.to_string(),
            service_name: self.service_name.clone(),
            service_type: self.service_type,
            status: aggregate_status(&endpoints),
            total_calls: stats.total,
            error_rate: stats.error_rate(),
            avg_response_time_ms: stats.avg_response_time_ms,
            uptime_percentage: stats.uptime_percentage(),
            p95_response_time_ms: percentile(&samples, 0.95),
            last_checked: self.last_checked,
            endpoints,
        }
    }
}

/// Service status over its endpoints' statuses.
///
/// Endpoints that have never been called are ignored; a service with no
/// observed endpoint is `Unknown`.
pub fn aggregate_status(endpoints: &[EndpointHealth]) -> HealthStatus {
    let observed: Vec<HealthStatus> = endpoints
        .iter()
        .map(|e| e.status)
        .filter(|s| *s != HealthStatus::Unknown)
        .collect();

    if observed.is_empty() {
        HealthStatus::Unknown
    } else if observed.iter().all(|s| *s == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else if observed.iter().all(|s| *s != HealthStatus::Healthy) {
        HealthStatus::Down
    } else {
        HealthStatus::Degraded
    }
}

/// Value at quantile `q` (0.0-1.0) of `samples`: sort a copy ascending and
/// index at `floor(n * q)`, clamped to the last element.
pub fn percentile(samples: &[u64], q: f64) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let index = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    Some(sorted[index])
}

/// Health rows of every tracked service, keyed by service id
pub struct HealthTracker {
    config: ConfigHandle,
    services: RwLock<HashMap<String, ServiceState>>,
}

impl HealthTracker {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a service and its known endpoints (`(endpoint, method)` pairs).
    /// Re-registering adds missing endpoints and keeps existing history.
    pub fn register_service(&self, service_name: &str, service_type: ServiceType, endpoints: &[(String, String)]) {
        let id = service_id(service_type, service_name);
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let service = services
            .entry(id)
            .or_insert_with(|| ServiceState::new(service_name, service_type));
        for key in endpoints {
            service.endpoints.entry(key.clone()).or_default();
        }
    }

    /// Removes a service and all of its endpoint rows
    pub fn deregister_service(&self, service_id: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_id)
            .is_some()
    }

    /// Folds one recorded call into its endpoint and service rows and returns
    /// the endpoint's updated health
    pub fn record(&self, call: &ServiceCall) -> EndpointHealth {
        let cfg = self.config.current();
        let since = cutoff(cfg.health_window());
        let id = call.service_id();

        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let service = services
            .entry(id.clone())
            .or_insert_with(|| ServiceState::new(&call.service_name, call.service_type));

        service.samples.push_back(call.response_time_ms);
        while service.samples.len() > cfg.percentile_sample_size {
            service.samples.pop_front();
        }
        service.last_checked = Some(call.timestamp);

        let endpoint = service
            .endpoints
            .entry((call.endpoint.clone(), call.method.clone()))
            .or_default();

        endpoint.window.push_back(Sample {
            timestamp: call.timestamp,
            response_time_ms: call.response_time_ms,
            success: call.success,
        });
        endpoint.prune(since, cfg.recorder.max_calls);
        endpoint.last_outcome = Some(call.success);
        endpoint.last_checked = Some(call.timestamp);
        if call.success {
            endpoint.consecutive_failures = 0;
            endpoint.last_success = Some(call.timestamp);
        } else {
            endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
            endpoint.last_failure = Some(call.timestamp);
        }

        let health = endpoint.snapshot(&call.endpoint, &call.method, since, cfg.alerts.response_time_ms);

        gauge!(
            "resilient_call.endpoint_error_rate",
            health.error_rate,
            "service_id" => id
        );

        health
    }

    /// One service by name or id, or every tracked service when `name` is `None`
    pub fn service_health(&self, name: Option<&str>) -> Vec<ServiceHealth> {
        let cfg = self.config.current();
        let since = cutoff(cfg.health_window());
        let threshold = cfg.alerts.response_time_ms;

        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut health: Vec<ServiceHealth> = services
            .iter()
            .filter(|(id, service)| name.map_or(true, |n| n == id.as_str() || n == service.service_name))
            .map(|(id, service)| service.snapshot(id, since, threshold))
            .collect();
        health.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        health
    }

    pub fn endpoint_health(&self, service_id: &str, endpoint: &str, method: &str) -> Option<EndpointHealth> {
        let cfg = self.config.current();
        let since = cutoff(cfg.health_window());

        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services
            .get(service_id)?
            .endpoints
            .get(&(endpoint.to_string(), method.to_string()))
            .map(|state| state.snapshot(endpoint, method, since, cfg.alerts.response_time_ms))
    }

    /// p95 over the service's most recent response-time samples
    pub fn p95_response_time(&self, service_id: &str) -> Option<u64> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let samples: Vec<u64> = services.get(service_id)?.samples.iter().copied().collect();
        percentile(&samples, 0.95)
    }

    pub fn service_ids(&self) -> Vec<String> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = services.keys().cloned().collect();
        ids.sort();
        ids
    }
}
