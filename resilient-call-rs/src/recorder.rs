//! # Call Recorder
//!
//! Bounded, in-memory log of call outcomes and retry attempts. Capacity is
//! enforced on every append (oldest first); age-based eviction runs from a
//! slower periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::logging::{LogLevel, ObservabilitySink};
use crate::types::{service_id, Error, ErrorKind, ServiceType};

const SOURCE: &str = "call-recorder";

/// One attempted remote invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub id: Uuid,
    pub correlation_id: String,
    pub service_name: String,
    pub service_type: ServiceType,
    pub endpoint: String,
    pub method: String,
    /// 200 for successes, [`Error::status_code`] for failures
    pub status_code: u16,
    pub response_time_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Retries that preceded this outcome
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServiceCall {
    pub fn success<S1, S2, S3, S4>(
        correlation_id: S1,
        service_name: S2,
        service_type: ServiceType,
        endpoint: S3,
        method: S4,
        response_time: Duration,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            service_name: service_name.into(),
            service_type,
            endpoint: endpoint.into(),
            method: method.into(),
            status_code: 200,
            response_time_ms: response_time.as_millis() as u64,
            success: true,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn failure<S1, S2, S3, S4>(
        correlation_id: S1,
        service_name: S2,
        service_type: ServiceType,
        endpoint: S3,
        method: S4,
        response_time: Duration,
        error: &Error,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self {
            status_code: error.status_code(),
            success: false,
            error_kind: Some(error.kind),
            error_message: Some(error.message.clone()),
            ..Self::success(correlation_id, service_name, service_type, endpoint, method, response_time)
        }
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The `serviceType:serviceName` key of the called service
    pub fn service_id(&self) -> String {
        service_id(self.service_type, &self.service_name)
    }
}

/// One retry scheduled after a failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub correlation_id: String,
    pub service_name: String,
    pub endpoint: String,
    /// The attempt that failed (1-indexed)
    pub attempt: u32,
    /// Backoff applied before the next attempt
    pub delay_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Query over recorded calls; every unset field matches everything
#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    pub service_name: Option<String>,
    pub service_type: Option<ServiceType>,
    pub endpoint: Option<String>,
    pub success: Option<bool>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

impl CallFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service<S: Into<String>>(mut self, service_name: S) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Trailing window ending now
    pub fn within(mut self, window: Duration) -> Self {
        self.since = cutoff(window);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, call: &ServiceCall) -> bool {
        self.service_name.as_ref().map_or(true, |s| *s == call.service_name)
            && self.service_type.map_or(true, |t| t == call.service_type)
            && self.endpoint.as_ref().map_or(true, |e| *e == call.endpoint)
            && self.success.map_or(true, |s| s == call.success)
            && self.correlation_id.as_ref().map_or(true, |c| *c == call.correlation_id)
            && self.since.map_or(true, |since| call.timestamp >= since)
    }
}

/// Query over recorded retry attempts
#[derive(Debug, Clone, Default)]
pub struct RetryFilter {
    pub service_name: Option<String>,
    pub endpoint: Option<String>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RetryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service<S: Into<String>>(mut self, service_name: S) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, attempt: &RetryAttempt) -> bool {
        self.service_name.as_ref().map_or(true, |s| *s == attempt.service_name)
            && self.endpoint.as_ref().map_or(true, |e| *e == attempt.endpoint)
            && self.correlation_id.as_ref().map_or(true, |c| *c == attempt.correlation_id)
            && self.since.map_or(true, |since| attempt.timestamp >= since)
    }
}

/// Append-only ring buffers of calls and retries, safe under concurrent writers
pub struct CallRecorder {
    config: ConfigHandle,
    calls: RwLock<VecDeque<ServiceCall>>,
    retries: RwLock<VecDeque<RetryAttempt>>,
    sink: Arc<dyn ObservabilitySink>,
}

impl CallRecorder {
    pub fn new(config: ConfigHandle, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            config,
            calls: RwLock::new(VecDeque::new()),
            retries: RwLock::new(VecDeque::new()),
            sink,
        }
    }

    pub fn record_call(&self, call: ServiceCall) {
        let capacity = self.config.current().recorder.max_calls;

        counter!(
            "resilient_call.calls",
            1,
            "service_type" => call.service_type.as_str(),
            "success" => if call.success { "true" } else { "false" }
        );
        histogram!(
            "resilient_call.response_time_ms",
            call.response_time_ms as f64,
            "service_type" => call.service_type.as_str()
        );

        let (level, message) = if call.success {
            (LogLevel::Info, "Service call succeeded")
        } else {
            (LogLevel::Warn, "Service call failed")
        };
        self.sink.log(
            level,
            SOURCE,
            message,
            serde_json::json!({
                "call_id": call.id,
                "service_name": call.service_name,
                "service_type": call.service_type,
                "endpoint": call.endpoint,
                "method": call.method,
                "status_code": call.status_code,
                "response_time_ms": call.response_time_ms,
                "retry_count": call.retry_count,
                "error_kind": call.error_kind.map(|k| k.tag()),
                "error": call.error_message,
            }),
            Some(&call.correlation_id),
        );

        let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);
        calls.push_back(call);
        while calls.len() > capacity {
            calls.pop_front();
        }
    }

    pub fn record_retry(&self, attempt: RetryAttempt) {
        let capacity = self.config.current().recorder.max_retry_attempts;

        counter!("resilient_call.retries", 1);
        self.sink.log(
            LogLevel::Info,
            SOURCE,
            "Retrying service call",
            serde_json::json!({
                "service_name": attempt.service_name,
                "endpoint": attempt.endpoint,
                "attempt": attempt.attempt,
                "delay_ms": attempt.delay_ms,
                "error_kind": attempt.error_kind.map(|k| k.tag()),
                "error": attempt.error,
            }),
            Some(&attempt.correlation_id),
        );

        let mut retries = self.retries.write().unwrap_or_else(PoisonError::into_inner);
        retries.push_back(attempt);
        while retries.len() > capacity {
            retries.pop_front();
        }
    }

    /// Matching calls in recording order
    pub fn calls(&self, filter: &CallFilter) -> Vec<ServiceCall> {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        let matched: Vec<ServiceCall> = calls.iter().filter(|c| filter.matches(c)).cloned().collect();
        keep_last(matched, filter.limit)
    }

    /// Matching retry attempts in recording order
    pub fn retries(&self, filter: &RetryFilter) -> Vec<RetryAttempt> {
        let retries = self.retries.read().unwrap_or_else(PoisonError::into_inner);
        let matched: Vec<RetryAttempt> = retries.iter().filter(|r| filter.matches(r)).cloned().collect();
        keep_last(matched, filter.limit)
    }

    /// Drops records older than `max_age`, returning how many were removed
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let cutoff = match cutoff(max_age) {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let removed_calls = {
            let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);
            let before = calls.len();
            calls.retain(|c| c.timestamp >= cutoff);
            before - calls.len()
        };
        let removed_retries = {
            let mut retries = self.retries.write().unwrap_or_else(PoisonError::into_inner);
            let before = retries.len();
            retries.retain(|r| r.timestamp >= cutoff);
            before - retries.len()
        };

        let removed = removed_calls + removed_retries;
        if removed > 0 {
            self.sink.log(
                LogLevel::Debug,
                SOURCE,
                "Expired records evicted",
                serde_json::json!({
                    "calls": removed_calls,
                    "retries": removed_retries,
                }),
                None,
            );
        }
        removed
    }

    /// Number of recorded calls
    pub fn len(&self) -> usize {
        self.calls.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retry_len(&self) -> usize {
        self.retries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.calls.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.retries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// `now - window`, or `None` when the window reaches past the representable range
pub(crate) fn cutoff(window: Duration) -> Option<DateTime<Utc>> {
    let window = chrono::Duration::from_std(window).ok()?;
    Utc::now().checked_sub_signed(window)
}

fn keep_last<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::logging::MemorySink;

    fn recorder(max_calls: usize) -> (CallRecorder, Arc<MemorySink>) {
        let mut config = MonitoringConfig::default();
        config.recorder.max_calls = max_calls;
        config.recorder.max_retry_attempts = max_calls;
        let sink = Arc::new(MemorySink::new());
        (CallRecorder::new(ConfigHandle::new(config), sink.clone()), sink)
    }

    fn call(service: &str, endpoint: &str, success: bool) -> ServiceCall {
        let ok = ServiceCall::success("corr", service, ServiceType::Api, endpoint, "GET", Duration::from_millis(20));
        if success {
            ok
        } else {
            ServiceCall::failure(
                "corr",
                service,
                ServiceType::Api,
                endpoint,
                "GET",
                Duration::from_millis(20),
                &Error::http(502, "bad gateway"),
            )
        }
    }

    fn retry(correlation_id: &str, attempt: u32) -> RetryAttempt {
        RetryAttempt {
            correlation_id: correlation_id.to_string(),
            service_name: "svc".to_string(),
            endpoint: "/a".to_string(),
            attempt,
            delay_ms: 100,
            success: false,
            error_kind: Some(ErrorKind::Network),
            error: Some("reset".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let (rec, _) = recorder(3);
        for i in 0..5 {
            rec.record_call(call("svc", &format!("/{}", i), true));
        }

        let endpoints: Vec<_> = rec.calls(&CallFilter::new()).into_iter().map(|c| c.endpoint).collect();
        assert_eq!(endpoints, vec!["/2", "/3", "/4"]);
        assert_eq!(rec.len(), 3);
    }

    #[test]
    fn test_filters() {
        let (rec, _) = recorder(100);
        rec.record_call(call("a", "/x", true));
        rec.record_call(call("a", "/y", false));
        rec.record_call(call("b", "/x", false));
        rec.record_call(
            ServiceCall::success("other", "a", ServiceType::Webhook, "/x", "POST", Duration::ZERO),
        );

        assert_eq!(rec.calls(&CallFilter::new().service("a")).len(), 3);
        assert_eq!(rec.calls(&CallFilter::new().endpoint("/x").success(false)).len(), 1);
        assert_eq!(rec.calls(&CallFilter::new().correlation_id("other")).len(), 1);
        assert_eq!(rec.calls(&CallFilter::new().service_type(ServiceType::Webhook)).len(), 1);

        let last_two = rec.calls(&CallFilter::new().limit(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].correlation_id, "other");
    }

    #[test]
    fn test_failure_record_carries_classification() {
        let failed = call("svc", "/a", false);
        assert_eq!(failed.status_code, 502);
        assert_eq!(failed.error_kind, Some(ErrorKind::Http(502)));
        assert_eq!(failed.service_id(), "api:svc");
    }

    #[test]
    fn test_age_eviction() {
        let (rec, sink) = recorder(100);
        let mut old = call("svc", "/old", true);
        old.timestamp = Utc::now() - chrono::Duration::hours(25);
        rec.record_call(old);
        rec.record_call(call("svc", "/new", true));

        let mut old_retry = retry("c1", 1);
        old_retry.timestamp = Utc::now() - chrono::Duration::hours(30);
        rec.record_retry(old_retry);
        rec.record_retry(retry("c2", 1));

        assert_eq!(rec.evict_expired(Duration::from_secs(24 * 3600)), 2);
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.retry_len(), 1);
        assert_eq!(sink.events_with_message("Expired records evicted").len(), 1);
    }

    #[test]
    fn test_retry_queries_and_sink_forwarding() {
        let (rec, sink) = recorder(100);
        rec.record_retry(retry("c1", 1));
        rec.record_retry(retry("c1", 2));
        rec.record_retry(retry("c2", 1));

        let attempts: Vec<_> = rec
            .retries(&RetryFilter::new().correlation_id("c1"))
            .into_iter()
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);

        rec.record_call(call("svc", "/a", false));
        assert_eq!(sink.counts_by_source().get(SOURCE), Some(&4));
        assert_eq!(sink.events_with_message("Service call failed")[0].correlation_id.as_deref(), Some("corr"));

        rec.clear();
        assert!(rec.is_empty());
        assert_eq!(rec.retry_len(), 0);
    }

    #[test]
    fn test_concurrent_writers() {
        let (rec, _) = recorder(10_000);
        let rec = Arc::new(rec);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let rec = rec.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        rec.record_call(call(&format!("svc-{}", t), &format!("/{}", i), i % 2 == 0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(rec.len(), 2_000);
        assert_eq!(rec.calls(&CallFilter::new().service("svc-3")).len(), 250);
    }
}
