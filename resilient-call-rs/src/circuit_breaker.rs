//! # Circuit Breaker Registry
//!
//! One independent state machine per service id (`serviceType:serviceName`).
//!
//! # State Transitions
//! ```text
//! Closed → Open:      consecutive failures reach the failure threshold
//! Open → Half-Open:   first admission check after the reset timeout (that caller is the probe)
//! Half-Open → Closed: the probe succeeds
//! Half-Open → Open:   the probe fails (new reset timeout)
//! ```
//!
//! Admission check and the open → half-open transition happen under the
//! same per-entry lock, so concurrent callers can never both become the
//! probe. Only the outcome reported with the probe's [`ProbeTicket`] settles
//! a half-open circuit; late outcomes of calls admitted earlier are ignored.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::logging::{LogLevel, ObservabilitySink};

const SOURCE: &str = "circuit-breaker";

// Stand-in for reset timeouts too large to add to an Instant
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, a single probe allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Identifies one half-open probe slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket {
    generation: u64,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call proceeds normally
    Allowed,
    /// Caller is the single half-open probe
    Probe(ProbeTicket),
    /// Call must fail fast
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected { .. })
    }
}

/// An admitted call's claim on its breaker.
///
/// [`CallPermit::record`] reports the terminal outcome. A probe permit
/// dropped without an outcome (caller gave up, task aborted, operation
/// panicked) frees the half-open slot so the next caller can probe.
#[must_use = "dropping a probe permit releases the half-open slot"]
pub struct CallPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    service_id: String,
    probe: Option<ProbeTicket>,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(registry: &'a CircuitBreakerRegistry, service_id: &str, probe: Option<ProbeTicket>) -> Self {
        Self {
            registry,
            service_id: service_id.to_string(),
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Settles the breaker with the call's terminal outcome
    pub fn record(mut self, success: bool) {
        self.settled = true;
        match self.probe {
            Some(ticket) => self.registry.record_probe_outcome(&self.service_id, ticket, success),
            None => self.registry.record_outcome(&self.service_id, success),
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(ticket) = self.probe {
            self.registry.release_probe(&self.service_id, ticket);
        }
    }
}

impl fmt::Debug for CallPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("service_id", &self.service_id)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Wall-clock time after which a probe is admitted (open state only)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
    probe_generation: u64,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_at: None,
            next_attempt: None,
            probe_in_flight: false,
            probe_generation: 0,
        }
    }

    fn claim_probe(&mut self) -> ProbeTicket {
        self.probe_in_flight = true;
        self.probe_generation = self.probe_generation.wrapping_add(1);
        ProbeTicket {
            generation: self.probe_generation,
        }
    }

    fn holds_probe(&self, ticket: ProbeTicket) -> bool {
        self.state == CircuitState::HalfOpen
            && self.probe_in_flight
            && self.probe_generation == ticket.generation
    }

    fn open(&mut self, now: Instant, reset_timeout: Duration) {
        self.state = CircuitState::Open;
        self.next_attempt = Some(now.checked_add(reset_timeout).unwrap_or_else(|| now + FAR_FUTURE));
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_attempt = None;
        self.probe_in_flight = false;
    }

    fn snapshot(&self, service_id: &str) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let next_attempt_at = self.next_attempt.and_then(|next| {
            let remaining = chrono::Duration::from_std(next.saturating_duration_since(now)).ok()?;
            Utc::now().checked_add_signed(remaining)
        });

        CircuitBreakerSnapshot {
            service_id: service_id.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            next_attempt_at,
            probe_in_flight: self.probe_in_flight,
        }
    }
}

#[derive(Debug)]
struct Transition {
    service_id: String,
    from: CircuitState,
    to: CircuitState,
    failure_count: u32,
}

/// Per-service circuit breakers
pub struct CircuitBreakerRegistry {
    config: ConfigHandle,
    circuits: DashMap<String, BreakerEntry>,
    sink: Arc<dyn ObservabilitySink>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: ConfigHandle, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            sink,
        }
    }

    /// Creates a closed breaker for the service if none exists yet
    pub fn register(&self, service_id: &str) {
        self.circuits
            .entry(service_id.to_string())
            .or_insert_with(BreakerEntry::new);
    }

    /// Drops the breaker of a de-registered service
    pub fn deregister(&self, service_id: &str) -> bool {
        self.circuits.remove(service_id).is_some()
    }

    /// Atomically decides whether a call may proceed.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open
    /// and admits the caller as the probe. Every other caller is rejected
    /// until the probe's outcome is recorded.
    pub fn admit(&self, service_id: &str) -> Admission {
        let now = Instant::now();
        let mut transition = None;

        let admission = {
            let mut entry = self
                .circuits
                .entry(service_id.to_string())
                .or_insert_with(BreakerEntry::new);

            match entry.state {
                CircuitState::Closed => Admission::Allowed,
                CircuitState::Open => {
                    let next = entry.next_attempt.unwrap_or(now);
                    if now >= next {
                        entry.state = CircuitState::HalfOpen;
                        let ticket = entry.claim_probe();
                        transition = Some(Transition {
                            service_id: service_id.to_string(),
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            failure_count: entry.failure_count,
                        });
                        Admission::Probe(ticket)
                    } else {
                        Admission::Rejected {
                            retry_after: next - now,
                        }
                    }
                }
                CircuitState::HalfOpen => {
                    if entry.probe_in_flight {
                        Admission::Rejected {
                            retry_after: Duration::ZERO,
                        }
                    } else {
                        Admission::Probe(entry.claim_probe())
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.emit(transition);
        }

        if let Admission::Rejected { retry_after } = admission {
            debug!(
                circuit = %service_id,
                remaining_ms = %retry_after.as_millis(),
                "Circuit open, request rejected"
            );
        }

        admission
    }

    /// Admits the caller and returns a permit that settles the breaker.
    ///
    /// Rejection yields the time left until a probe may be admitted.
    pub fn permit(&self, service_id: &str) -> Result<CallPermit<'_>, Duration> {
        match self.admit(service_id) {
            Admission::Allowed => Ok(CallPermit::new(self, service_id, None)),
            Admission::Probe(ticket) => Ok(CallPermit::new(self, service_id, Some(ticket))),
            Admission::Rejected { retry_after } => Err(retry_after),
        }
    }

    /// True while the breaker rejects callers: open with the reset timeout
    /// pending, or half-open with a probe in flight.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open
    /// here and reports `false`; the next [`Self::admit`] claims the probe.
    pub fn is_open(&self, service_id: &str) -> bool {
        let now = Instant::now();
        let mut transition = None;

        let open = match self.circuits.get_mut(service_id) {
            None => false,
            Some(mut entry) => match entry.state {
                CircuitState::Closed => false,
                CircuitState::HalfOpen => entry.probe_in_flight,
                CircuitState::Open => {
                    if now >= entry.next_attempt.unwrap_or(now) {
                        entry.state = CircuitState::HalfOpen;
                        entry.probe_in_flight = false;
                        transition = Some(Transition {
                            service_id: service_id.to_string(),
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            failure_count: entry.failure_count,
                        });
                        false
                    } else {
                        true
                    }
                }
            },
        };

        if let Some(transition) = transition {
            self.emit(transition);
        }
        open
    }

    /// Records the terminal outcome of a call admitted while closed
    pub fn record_outcome(&self, service_id: &str, success: bool) {
        self.settle(service_id, success, None);
    }

    /// Records the outcome of the half-open probe holding `ticket`. A ticket
    /// that no longer holds the slot counts as an ordinary late outcome.
    pub fn record_probe_outcome(&self, service_id: &str, ticket: ProbeTicket, success: bool) {
        self.settle(service_id, success, Some(ticket));
    }

    /// Frees the half-open probe slot held by `ticket` without counting an
    /// outcome
    pub fn release_probe(&self, service_id: &str, ticket: ProbeTicket) {
        if let Some(mut entry) = self.circuits.get_mut(service_id) {
            if entry.holds_probe(ticket) {
                entry.probe_in_flight = false;
                debug!(circuit = %service_id, "Probe released without outcome");
            }
        }
    }

    fn settle(&self, service_id: &str, success: bool, probe: Option<ProbeTicket>) {
        let cfg = self.config.current();
        let policy = &cfg.circuit_breaker;
        let now = Instant::now();

        let transition = {
            let mut entry = self
                .circuits
                .entry(service_id.to_string())
                .or_insert_with(BreakerEntry::new);
            let from = entry.state;
            let is_probe = probe.map_or(false, |ticket| entry.holds_probe(ticket));

            let window_expired = entry
                .last_failure
                .map_or(false, |last| now.duration_since(last) > policy.monitoring_window());
            if !success {
                entry.last_failure = Some(now);
                entry.last_failure_at = Some(Utc::now());
            }

            match (entry.state, success) {
                (CircuitState::Closed, true) => entry.failure_count = 0,
                (CircuitState::Closed, false) => {
                    entry.failure_count = if window_expired {
                        1
                    } else {
                        entry.failure_count.saturating_add(1)
                    };
                    if entry.failure_count >= policy.failure_threshold {
                        entry.open(now, policy.reset_timeout());
                    }
                }
                (CircuitState::HalfOpen, true) if is_probe => entry.close(),
                (CircuitState::HalfOpen, false) if is_probe => {
                    entry.failure_count = entry.failure_count.saturating_add(1);
                    entry.open(now, policy.reset_timeout());
                }
                // Only the probe settles a half-open circuit
                (CircuitState::HalfOpen, _) => {
                    debug!(circuit = %service_id, success, "Late outcome ignored while half-open");
                }
                // Admitted before the circuit opened; the open timer stays
                // authoritative.
                (CircuitState::Open, true) => {}
                (CircuitState::Open, false) => {
                    entry.failure_count = entry.failure_count.saturating_add(1);
                }
            }

            (from != entry.state).then(|| Transition {
                service_id: service_id.to_string(),
                from,
                to: entry.state,
                failure_count: entry.failure_count,
            })
        };

        if let Some(transition) = transition {
            self.emit(transition);
        }
    }

    /// Gets the current state of a circuit
    pub fn state(&self, service_id: &str) -> CircuitState {
        self.circuits
            .get(service_id)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, service_id: &str) -> Option<CircuitBreakerSnapshot> {
        self.circuits
            .get(service_id)
            .map(|entry| entry.snapshot(service_id))
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        all
    }

    /// Reset a circuit to closed state
    pub fn reset(&self, service_id: &str) {
        let transition = self.circuits.get_mut(service_id).and_then(|mut entry| {
            let from = entry.state;
            entry.close();
            entry.last_failure = None;
            (from != CircuitState::Closed).then(|| Transition {
                service_id: service_id.to_string(),
                from,
                to: CircuitState::Closed,
                failure_count: 0,
            })
        });

        info!(circuit = %service_id, "Circuit manually reset to CLOSED state");
        if let Some(transition) = transition {
            self.emit(transition);
        }
    }

    /// Resets all circuits to closed state
    pub fn reset_all(&self) {
        let ids: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.reset(&id);
        }
    }

    fn emit(&self, transition: Transition) {
        let level = match transition.to {
            CircuitState::Open => {
                warn!(
                    circuit = %transition.service_id,
                    from = %transition.from,
                    failures = transition.failure_count,
                    "Circuit OPEN"
                );
                LogLevel::Warn
            }
            CircuitState::HalfOpen => {
                info!(circuit = %transition.service_id, "Circuit HALF-OPEN: Testing service recovery");
                LogLevel::Info
            }
            CircuitState::Closed => {
                info!(circuit = %transition.service_id, from = %transition.from, "Circuit CLOSED");
                LogLevel::Info
            }
        };

        let state_value = match transition.to {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        gauge!(
            "resilient_call.circuit_state",
            state_value,
            "service_id" => transition.service_id.clone()
        );

        self.sink.log(
            level,
            SOURCE,
            "Circuit breaker state changed",
            serde_json::json!({
                "service_id": transition.service_id,
                "from": transition.from,
                "to": transition.to,
                "failure_count": transition.failure_count,
            }),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::logging::MemorySink;

    fn registry(threshold: u32, reset_ms: u64) -> (CircuitBreakerRegistry, Arc<MemorySink>) {
        let mut config = MonitoringConfig::default();
        config.circuit_breaker.failure_threshold = threshold;
        config.circuit_breaker.reset_timeout_ms = reset_ms;
        let sink = Arc::new(MemorySink::new());
        (
            CircuitBreakerRegistry::new(ConfigHandle::new(config), sink.clone()),
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_at_threshold() {
        let (cb, _) = registry(3, 30_000);
        let service = "api:svc-x";

        cb.register(service);
        assert_eq!(cb.state(service), CircuitState::Closed);

        cb.record_outcome(service, false);
        cb.record_outcome(service, false);
        assert_eq!(cb.state(service), CircuitState::Closed);
        assert!(!cb.is_open(service));

        cb.record_outcome(service, false);
        assert_eq!(cb.state(service), CircuitState::Open);
        assert!(cb.is_open(service));

        let snapshot = cb.snapshot(service).unwrap();
        assert_eq!(snapshot.failure_count, 3);
        assert!(snapshot.next_attempt_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let (cb, _) = registry(3, 30_000);
        let service = "api:flaky";

        cb.record_outcome(service, false);
        cb.record_outcome(service, false);
        cb.record_outcome(service, true);
        cb.record_outcome(service, false);
        cb.record_outcome(service, false);

        assert_eq!(cb.state(service), CircuitState::Closed);
        assert_eq!(cb.snapshot(service).unwrap().failure_count, 2);
    }

    fn probe_ticket(admission: Admission) -> ProbeTicket {
        match admission {
            Admission::Probe(ticket) => ticket,
            other => panic!("expected a probe admission, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let (cb, sink) = registry(1, 30_000);
        let service = "webhook:hook";

        cb.record_outcome(service, false);
        assert!(cb.is_open(service));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(cb.admit(service), Admission::Rejected { .. }));

        tokio::time::advance(Duration::from_secs(2)).await;
        let ticket = probe_ticket(cb.admit(service));
        assert_eq!(cb.state(service), CircuitState::HalfOpen);

        // Second caller while the probe is in flight fails fast
        assert!(cb.is_open(service));
        assert!(cb.admit(service).is_rejected());

        cb.record_probe_outcome(service, ticket, true);
        assert_eq!(cb.state(service), CircuitState::Closed);
        assert_eq!(cb.snapshot(service).unwrap().failure_count, 0);

        let transitions = sink.events_with_message("Circuit breaker state changed");
        assert_eq!(transitions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let (cb, _) = registry(2, 10_000);
        let service = "api:down";

        cb.record_outcome(service, false);
        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(11)).await;

        let ticket = probe_ticket(cb.admit(service));
        cb.record_probe_outcome(service, ticket, false);
        assert_eq!(cb.state(service), CircuitState::Open);

        // A fresh reset timeout applies
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.is_open(service));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cb.is_open(service));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_is_open_check_moves_to_half_open() {
        let (cb, _) = registry(1, 1_000);
        let service = "api:lazy";

        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!cb.is_open(service));
        assert_eq!(cb.state(service), CircuitState::HalfOpen);

        // The slot is still free for exactly one caller
        let ticket = probe_ticket(cb.admit(service));
        assert!(cb.is_open(service));
        cb.record_probe_outcome(service, ticket, true);
        assert_eq!(cb.state(service), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_lets_next_caller_probe() {
        let (cb, _) = registry(1, 1_000);
        let service = "api:cancel";

        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        let ticket = probe_ticket(cb.admit(service));
        assert!(cb.is_open(service));

        cb.release_probe(service, ticket);
        assert!(matches!(cb.admit(service), Admission::Probe(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_do_not_settle_half_open() {
        let (cb, _) = registry(1, 1_000);
        let service = "api:straggler";

        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        let ticket = probe_ticket(cb.admit(service));

        // Calls admitted while closed finish after the probe started
        cb.record_outcome(service, true);
        assert_eq!(cb.state(service), CircuitState::HalfOpen);
        assert!(cb.admit(service).is_rejected());

        cb.record_outcome(service, false);
        assert_eq!(cb.state(service), CircuitState::HalfOpen);
        assert!(cb.admit(service).is_rejected());

        cb.record_probe_outcome(service, ticket, true);
        assert_eq!(cb.state(service), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_does_not_touch_current_slot() {
        let (cb, _) = registry(1, 1_000);
        let service = "api:reset-mid-probe";

        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        let stale = probe_ticket(cb.admit(service));

        cb.reset(service);
        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        let current = probe_ticket(cb.admit(service));
        assert_ne!(stale, current);

        cb.release_probe(service, stale);
        assert!(cb.is_open(service));
        cb.record_probe_outcome(service, stale, true);
        assert_eq!(cb.state(service), CircuitState::HalfOpen);

        cb.record_probe_outcome(service, current, true);
        assert_eq!(cb.state(service), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_permit_frees_slot() {
        let (cb, _) = registry(1, 1_000);
        let service = "api:abandoned";

        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;

        let permit = cb.permit(service).unwrap();
        assert!(permit.is_probe());
        assert!(cb.permit(service).is_err());
        drop(permit);

        let permit = cb.permit(service).unwrap();
        assert!(permit.is_probe());
        permit.record(true);
        assert_eq!(cb.state(service), CircuitState::Closed);

        // Closed-state permits carry no probe slot
        let permit = cb.permit(service).unwrap();
        assert!(!permit.is_probe());
        drop(permit);
        assert_eq!(cb.state(service), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_window_restarts_count() {
        let mut config = MonitoringConfig::default();
        config.circuit_breaker.failure_threshold = 3;
        config.circuit_breaker.monitoring_window_ms = 1_000;
        let cb = CircuitBreakerRegistry::new(ConfigHandle::new(config), Arc::new(MemorySink::new()));
        let service = "api:slow-burn";

        cb.record_outcome(service, false);
        cb.record_outcome(service, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        cb.record_outcome(service, false);

        assert_eq!(cb.state(service), CircuitState::Closed);
        assert_eq!(cb.snapshot(service).unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_are_independent() {
        let (cb, _) = registry(1, 30_000);

        cb.record_outcome("api:a", false);
        assert!(cb.is_open("api:a"));
        assert!(!cb.is_open("api:b"));
        assert_eq!(cb.state("api:b"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let (cb, _) = registry(1, 30_000);
        cb.record_outcome("api:a", false);
        cb.record_outcome("api:b", false);

        cb.reset("api:a");
        assert_eq!(cb.state("api:a"), CircuitState::Closed);
        assert_eq!(cb.state("api:b"), CircuitState::Open);

        cb.reset_all();
        assert!(cb
            .snapshots()
            .iter()
            .all(|s| s.state == CircuitState::Closed && s.failure_count == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_single_probe_under_concurrency() {
        let (cb, _) = registry(1, 20);
        let cb = Arc::new(cb);
        let service = "api:contended";

        cb.record_outcome(service, false);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(32));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let cb = cb.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cb.admit(service)
            }));
        }

        let mut probes = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Probe(_)) {
                probes += 1;
            }
        }
        assert_eq!(probes, 1);
        assert_eq!(cb.state(service), CircuitState::HalfOpen);
    }
}
