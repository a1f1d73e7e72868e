//! Common Infrastructure Module
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - The root error type

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ConfigError, Network, StoreConfig};
pub use error::{Result, StoreError};
pub use logging::{
    init_from_config, init_logging, log_broken, log_channel_event, log_migration_event,
    log_output_event, ErrorDetails, EventCategory, LogEvent, LogLevel, LoggingError,
};
