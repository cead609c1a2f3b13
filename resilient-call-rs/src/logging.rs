//! # Structured Logging
//!
//! Subscriber initialisation, correlation IDs and the observability sink
//! boundary. This layer never formats log lines for the sink itself; it
//! hands over a level, a source, a message and structured attributes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::types::{Error, ErrorKind, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "resilient-call".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Initializes the structured logging system
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    // Don't re-initialize if already done
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    // JSON and text layers have different concrete types, so both are boxed.
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.json_format {
        layers.push(
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_target(true)
                .boxed(),
        );
    } else {
        layers.push(fmt::layer().with_target(true).with_thread_ids(true).boxed());
    }

    if config.file_output {
        if let Some(log_dir) = config.log_dir.as_deref() {
            let file_appender = RollingFileAppender::new(
                tracing_appender::rolling::Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = NonBlocking::new(file_appender);

            // The guard flushes on drop, so it lives as long as the process
            Box::leak(Box::new(guard));

            layers.push(fmt::layer().with_writer(non_blocking).with_ansi(false).boxed());
        }
    }

    let subscriber = Registry::default().with(layers).with(filter);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(Error::new(
            ErrorKind::Unknown,
            format!("Failed to set global subscriber: {}", e),
        ));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Generates a fresh correlation ID
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Level of an event forwarded to the observability sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// External structured-logging collaborator.
///
/// Every recorded call, retry, breaker transition and alert is handed to the
/// sink. Implementations must not block; they run between suspension points
/// of in-flight calls.
pub trait ObservabilitySink: Send + Sync {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        attributes: serde_json::Value,
        correlation_id: Option<&str>,
    );
}

/// Sink that turns every event into a `tracing` event
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        attributes: serde_json::Value,
        correlation_id: Option<&str>,
    ) {
        let correlation_id = correlation_id.unwrap_or("none");
        match level {
            LogLevel::Debug => {
                tracing::debug!(source, correlation_id, attributes = %attributes, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(source, correlation_id, attributes = %attributes, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(source, correlation_id, attributes = %attributes, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(source, correlation_id, attributes = %attributes, "{}", message)
            }
        }
    }
}

/// One event captured by [`MemorySink`]
#[derive(Debug, Clone)]
pub struct SinkEvent {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub attributes: serde_json::Value,
    pub correlation_id: Option<String>,
}

/// Sink that keeps events in memory, for diagnostics endpoints and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Events whose message equals `message`
    pub fn events_with_message(&self, message: &str) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.message == message)
            .collect()
    }

    /// Event counts keyed by source
    pub fn counts_by_source(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.events() {
            *counts.entry(event.source).or_insert(0) += 1;
        }
        counts
    }
}

impl ObservabilitySink for MemorySink {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        attributes: serde_json::Value,
        correlation_id: Option<&str>,
    ) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(SinkEvent {
                level,
                source: source.to_string(),
                message: message.to_string(),
                attributes,
                correlation_id: correlation_id.map(str::to_string),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_correlation_id() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_memory_sink_captures_events() {
        let sink = MemorySink::new();
        sink.log(
            LogLevel::Warn,
            "circuit-breaker",
            "Circuit opened",
            serde_json::json!({ "service_id": "api:svc" }),
            Some("corr-1"),
        );
        sink.log(LogLevel::Info, "recorder", "Call recorded", serde_json::json!({}), None);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(sink.events_with_message("Circuit opened").len(), 1);
        assert_eq!(sink.counts_by_source().get("recorder"), Some(&1));
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.log(LogLevel::Error, "test", "message", serde_json::json!({"a": 1}), None);
    }
}
