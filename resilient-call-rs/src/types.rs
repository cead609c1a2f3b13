//! # Classified Error Types
//!
//! Every failure that crosses the remote-call layer is an [`Error`] tagged
//! with an explicit [`ErrorKind`] at the point where it happened. Retry
//! eligibility, recorded status codes and caller fallbacks are all derived
//! from that tag, never from message text.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The severity level of an error or alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, not an actual failure
    Info,
    /// Degradation worth watching
    Warning,
    /// A failure affecting callers
    Major,
    /// A failure of a required dependency
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Major
    }
}

/// Failure taxonomy for remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Connection-level failure
    Network,
    /// The attempt exceeded its deadline
    Timeout,
    /// The remote responded with a failure status
    Http(u16),
    /// Malformed request or response shape
    Validation,
    /// The circuit breaker rejected the call without attempting it
    CircuitOpen,
    /// The caller cancelled the call
    Cancelled,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorKind {
    /// Stable tag used in records, logs and analytics
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network-error",
            ErrorKind::Timeout => "timeout-error",
            ErrorKind::Http(_) => "http-error",
            ErrorKind::Validation => "validation-error",
            ErrorKind::CircuitOpen => "circuit-open",
            ErrorKind::Cancelled | ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a failure of this kind may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Network | ErrorKind::Timeout => true,
            ErrorKind::Http(status) => matches!(status, 408 | 429 | 500..=599),
            ErrorKind::Validation
            | ErrorKind::CircuitOpen
            | ErrorKind::Cancelled
            | ErrorKind::Unknown => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Http(status) => write!(f, "http-error ({})", status),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            other => write!(f, "{}", other.tag()),
        }
    }
}

/// Kind of remote service being called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Webhook,
    Api,
    InternalRpc,
    External,
    Database,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Webhook => "webhook",
            ServiceType::Api => "api",
            ServiceType::InternalRpc => "internal-rpc",
            ServiceType::External => "external",
            ServiceType::Database => "database",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the `serviceType:serviceName` key that breakers and health rows use
pub fn service_id(service_type: ServiceType, service_name: &str) -> String {
    format!("{}:{}", service_type, service_name)
}

/// Classified failure of a remote call
///
/// Note: `Clone` is implemented manually so that cloned errors drop the
/// opaque `cause`. Records and logs only need the structured fields.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// The time when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Error severity level
    pub severity: Severity,
    /// The service the call was addressed to
    pub service: Option<String>,
    /// The endpoint the call was addressed to
    pub endpoint: Option<String>,
    /// Correlation ID linking all attempts of one logical call
    pub correlation_id: Option<String>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Underlying cause (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            timestamp: self.timestamp,
            severity: self.severity,
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
            correlation_id: self.correlation_id.clone(),
            context: self.context.clone(),
            cause: None,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            severity: Severity::default(),
            service: None,
            endpoint: None,
            correlation_id: None,
            context: serde_json::Map::new(),
            cause: None,
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn http<S: Into<String>>(status: u16, message: S) -> Self {
        Self::new(ErrorKind::Http(status), message)
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn circuit_open<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::CircuitOpen, message).severity(Severity::Warning)
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Cancelled, message).severity(Severity::Info)
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the service name
    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the endpoint
    pub fn endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the correlation ID
    pub fn correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns true if a retry may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns true if the breaker rejected the call
    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    /// Status code recorded for a failed call of this kind
    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::Http(status) => status,
            ErrorKind::Timeout => 408,
            ErrorKind::CircuitOpen => 503,
            ErrorKind::Validation => 400,
            ErrorKind::Cancelled => 499,
            ErrorKind::Network | ErrorKind::Unknown => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(service) = &self.service {
            write!(f, " [Service: {}]", service)?;
        }

        if let Some(endpoint) = &self.endpoint {
            write!(f, " [Endpoint: {}]", endpoint)?;
        }

        if let Some(correlation_id) = &self.correlation_id {
            write!(f, " [CorrelationID: {}]", correlation_id)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Network
        } else if let Some(status) = err.status() {
            ErrorKind::Http(status.as_u16())
        } else if err.is_decode() || err.is_builder() {
            ErrorKind::Validation
        } else if err.is_request() {
            ErrorKind::Network
        } else {
            ErrorKind::Unknown
        };

        Self::new(kind, format!("HTTP request error: {}", err)).cause(err)
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::Validation, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Validation, format!("JSON error: {}", err)).cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::http(502, "Bad gateway")
            .service("api:billing")
            .endpoint("/charge")
            .context("attempt", 2)
            .severity(Severity::Warning);

        assert_eq!(err.kind, ErrorKind::Http(502));
        assert_eq!(err.message, "Bad gateway");
        assert_eq!(err.service, Some("api:billing".to_string()));
        assert_eq!(err.endpoint, Some("/charge".to_string()));
        assert_eq!(err.severity, Severity::Warning);
        assert_eq!(err.context.get("attempt"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::timeout("deadline exceeded")
            .service("webhook:slack")
            .correlation_id("abc");

        let display = format!("{}", err);
        assert!(display.contains("MAJOR"));
        assert!(display.contains("timeout-error"));
        assert!(display.contains("deadline exceeded"));
        assert!(display.contains("Service: webhook:slack"));
        assert!(display.contains("CorrelationID: abc"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::network("reset").is_retryable());
        assert!(Error::timeout("slow").is_retryable());
        assert!(Error::http(408, "").is_retryable());
        assert!(Error::http(429, "").is_retryable());
        assert!(Error::http(500, "").is_retryable());
        assert!(Error::http(503, "").is_retryable());
        assert!(Error::http(599, "").is_retryable());

        assert!(!Error::http(400, "").is_retryable());
        assert!(!Error::http(404, "").is_retryable());
        assert!(!Error::http(600, "").is_retryable());
        assert!(!Error::validation("bad shape").is_retryable());
        assert!(!Error::circuit_open("open").is_retryable());
        assert!(!Error::cancelled("stop").is_retryable());
        assert!(!Error::new(ErrorKind::Unknown, "?").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::circuit_open("open").status_code(), 503);
        assert_eq!(Error::timeout("slow").status_code(), 408);
        assert_eq!(Error::http(418, "teapot").status_code(), 418);
        assert_eq!(Error::network("reset").status_code(), 0);
    }

    #[test]
    fn test_clone_drops_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::network("connection reset").cause(io);
        assert!(err.source().is_some());

        let cloned = err.clone();
        assert!(cloned.source().is_none());
        assert_eq!(cloned.id, err.id);
        assert_eq!(cloned.kind, ErrorKind::Network);
    }

    #[test]
    fn test_service_id() {
        assert_eq!(service_id(ServiceType::InternalRpc, "ledger"), "internal-rpc:ledger");
        assert_eq!(service_id(ServiceType::Webhook, "svc-x"), "webhook:svc-x");
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(ErrorKind::Cancelled.tag(), "unknown");
        assert_eq!(ErrorKind::Http(503).tag(), "http-error");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit-open");
    }
}
