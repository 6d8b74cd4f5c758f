//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the relay.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{AppConfig, ConfigError};
pub use error::AppError;
pub use logging::{
    init_from_config, init_logging, log_deposit_event, log_settlement_event, EventCategory,
    LogEvent, LogLevel, LoggingError,
};
