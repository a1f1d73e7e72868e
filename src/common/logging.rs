//! Structured Logging for the Channel Store
//!
//! Store events (migrations, output status changes, channel lifecycle) are
//! emitted as JSON payloads through `tracing`, so the same log stream works for
//! a terminal and for log aggregation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use chanstore::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, false)?;
//! tracing::info!(target: "chanstore::wallet", channel = dbid, "channel closed");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" | "unusual" => LogLevel::Warn,
            "error" | "broken" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Schema upgrades
    Migration,
    /// Wallet output status changes
    Output,
    /// Channel lifecycle
    Channel,
    /// HTLC bookkeeping
    Htlc,
    /// Forwarding ledger
    Forward,
    /// Startup, shutdown
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add error details
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Store Event Logging
// ============================================================================

/// Log a completed migration pass
pub fn log_migration_event(from_version: i64, to_version: i64, software_version: &str) {
    let event = LogEvent::new(
        LogLevel::Info,
        EventCategory::Migration,
        format!("Updated database from version {} to {}", from_version, to_version),
    )
    .with_data(serde_json::json!({
        "from": from_version,
        "to": to_version,
        "software_version": software_version,
    }));

    tracing::info!(target: "chanstore::migrations", "{}", event.to_json());
}

/// Log an output status change that was not requested by the owner of the output
pub fn log_output_event(txid: &str, vout: u32, old_status: &str, new_status: &str) {
    let event = LogEvent::new(
        LogLevel::Warn,
        EventCategory::Output,
        format!("reserved output {}/{} reset to {}", txid, vout, new_status),
    )
    .with_data(serde_json::json!({
        "txid": txid,
        "vout": vout,
        "old_status": old_status,
        "new_status": new_status,
    }));

    tracing::warn!(target: "chanstore::wallet", "{}", event.to_json());
}

/// Log a channel lifecycle transition
pub fn log_channel_event(event_type: &str, channel_dbid: u64, state: &str) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Channel, event_type).with_data(
        serde_json::json!({
            "channel_dbid": channel_dbid,
            "state": state,
        }),
    );

    tracing::info!(target: "chanstore::wallet", "{}", event.to_json());
}

/// Log an inconsistency that is tolerated but indicates a bug somewhere upstream
pub fn log_broken(category: EventCategory, code: &str, message: impl Into<String>) {
    let message = message.into();
    let event = LogEvent::new(LogLevel::Error, category, message.clone()).with_error(code, message);

    tracing::error!(target: "chanstore::wallet", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// # Arguments
/// * `level` - Minimum log level to output
/// * `json_format` - Use JSON format
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let level_name = format!("{:?}", level).to_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chanstore={}", level_name)));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from loaded configuration
pub fn init_from_config(config: &super::config::StoreConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Migration, "upgrade")
            .with_data(serde_json::json!({"from": -1, "to": 41}));

        let json = event.to_json();
        assert!(json.contains("upgrade"));
        assert!(json.contains("\"migration\""));
        assert!(json.contains("41"));
    }

    #[test]
    fn test_error_details() {
        let event = LogEvent::new(LogLevel::Error, EventCategory::Forward, "fee underflow")
            .with_error("FEE_UNDERFLOW", "in 10 < out 20");
        let json = event.to_json();
        assert!(json.contains("FEE_UNDERFLOW"));
        assert!(json.contains("\"forward\""));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("unusual"), LogLevel::Warn);
        assert_eq!(LogLevel::from("broken"), LogLevel::Error);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }
}
