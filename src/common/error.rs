//! Common Error Types for the Channel Store
//!
//! Provides a single error type for callers that drive the whole engine
//! (startup, the binary) instead of one component.

use thiserror::Error;

use crate::db::DbError;
use crate::wallet::WalletError;

/// Root error type for the channel store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Statement, transaction and migration errors
    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// Wallet bookkeeping errors
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the node must abort rather than continue after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Config(_) | StoreError::Logging(_) | StoreError::Io(_) => true,
            StoreError::Db(e) => e.is_fatal(),
            StoreError::Wallet(e) => e.is_fatal(),
        }
    }

    /// Get a stable error code for reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::Config(_) => "CONFIG_ERROR",
            StoreError::Logging(_) => "LOGGING_ERROR",
            StoreError::Db(DbError::Downgrade { .. }) => "DB_DOWNGRADE",
            StoreError::Db(DbError::Corrupt(_)) => "DB_CORRUPT",
            StoreError::Db(_) => "DB_ERROR",
            StoreError::Wallet(WalletError::NetworkMismatch { .. }) => "NETWORK_MISMATCH",
            StoreError::Wallet(_) => "WALLET_ERROR",
            StoreError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = StoreError::from(DbError::Downgrade {
            current: 40,
            available: 30,
        });
        assert!(err.to_string().contains("40"));
        assert_eq!(err.error_code(), "DB_DOWNGRADE");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_recoverable_errors() {
        let err = StoreError::from(WalletError::NotFound("shachain 3".into()));
        assert_eq!(err.error_code(), "WALLET_ERROR");
        assert!(!err.is_fatal());

        let dup = StoreError::from(DbError::Duplicate("outputs_insert".into()));
        assert!(!dup.is_fatal());
    }
}
