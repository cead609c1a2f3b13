//! Call analytics over a trailing window of recorded calls and retries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::percentile;
use crate::recorder::{RetryAttempt, ServiceCall};

/// Per-service slice of [`CallAnalytics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
}

/// Aggregated view of recorded traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnalytics {
    pub service_name: Option<String>,
    pub window_hours: u32,
    pub generated_at: DateTime<Utc>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: Option<u64>,
    pub total_retries: u64,
    /// Failed calls by error tag
    pub error_breakdown: BTreeMap<String, u64>,
    /// Calls rejected by an open circuit
    pub circuit_open_rejections: u64,
    pub services: BTreeMap<String, ServiceStats>,
}

impl CallAnalytics {
    /// Aggregates already-filtered calls and retries
    pub fn compute(
        service_name: Option<&str>,
        window_hours: u32,
        calls: &[ServiceCall],
        retries: &[RetryAttempt],
    ) -> Self {
        let total_calls = calls.len() as u64;
        let successful_calls = calls.iter().filter(|c| c.success).count() as u64;
        let failed_calls = total_calls - successful_calls;

        let mut error_breakdown = BTreeMap::new();
        let mut circuit_open_rejections = 0;
        for call in calls.iter().filter(|c| !c.success) {
            let tag = call.error_kind.map_or("unknown", |k| k.tag());
            if tag == "circuit-open" {
                circuit_open_rejections += 1;
            }
            *error_breakdown.entry(tag.to_string()).or_insert(0) += 1;
        }

        let mut services: BTreeMap<String, ServiceStats> = BTreeMap::new();
        let mut response_sums: BTreeMap<String, u128> = BTreeMap::new();
        for call in calls {
            let stats = services.entry(call.service_name.clone()).or_default();
            stats.total_calls += 1;
            if !call.success {
                stats.failed_calls += 1;
            }
            *response_sums.entry(call.service_name.clone()).or_insert(0) += u128::from(call.response_time_ms);
        }
        for (name, stats) in services.iter_mut() {
            stats.error_rate = stats.failed_calls as f64 / stats.total_calls as f64 * 100.0;
            let sum = response_sums.get(name).copied().unwrap_or(0);
            stats.avg_response_time_ms = sum as f64 / stats.total_calls as f64;
        }

        let response_times: Vec<u64> = calls.iter().map(|c| c.response_time_ms).collect();
        let avg_response_time_ms = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().map(|&ms| u128::from(ms)).sum::<u128>() as f64 / response_times.len() as f64
        };

        Self {
            service_name: service_name.map(str::to_string),
            window_hours,
            generated_at: Utc::now(),
            total_calls,
            successful_calls,
            failed_calls,
            success_rate: if total_calls == 0 {
                100.0
            } else {
                successful_calls as f64 / total_calls as f64 * 100.0
            },
            avg_response_time_ms,
            p95_response_time_ms: percentile(&response_times, 0.95),
            total_retries: retries.len() as u64,
            error_breakdown,
            circuit_open_rejections,
            services,
        }
    }
}
