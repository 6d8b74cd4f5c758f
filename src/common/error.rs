//! Common Error Types
//!
//! Provides unified error handling across all modules.

use thiserror::Error;

use crate::storage::StorageError;
use crate::watcher::resolver::ResolveError;

/// Root error type for the relay
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// RPC lookup failed
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolveError),

    /// Unrecoverable failure while starting up
    #[error("startup error: {0}")]
    Startup(String),
}

impl AppError {
    /// Create a startup error
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Whether retrying without operator action cannot help
    ///
    /// Storage and RPC failures may clear on a restart; bad configuration and
    /// startup failures will not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::Logging(_) | AppError::Startup(_)
        )
    }

    /// Get error code for structured log events
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Logging(_) => "LOGGING_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Resolution(_) => "RESOLUTION_FAILURE",
            AppError::Startup(_) => "FATAL_STARTUP_FAILURE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ConfigError;

    #[test]
    fn test_error_creation() {
        let err = AppError::startup("database unreachable");
        assert!(err.to_string().contains("database unreachable"));
        assert_eq!(err.error_code(), "FATAL_STARTUP_FAILURE");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_errors() {
        let config: AppError =
            ConfigError::InvalidValue("--port".to_string(), "abc".to_string()).into();
        assert!(config.is_fatal());
        assert_eq!(config.error_code(), "CONFIG_ERROR");

        let storage: AppError = StorageError::Database("locked".to_string()).into();
        assert!(!storage.is_fatal());
        assert_eq!(storage.error_code(), "STORAGE_ERROR");

        let rpc: AppError = ResolveError::Rpc("node unavailable".to_string()).into();
        assert!(!rpc.is_fatal());
        assert_eq!(rpc.error_code(), "RESOLUTION_FAILURE");
    }
}
