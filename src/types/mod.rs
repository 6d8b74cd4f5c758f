//! Shared Types Module
//!
//! Data types shared across the relay.

pub mod deposit;
pub mod units;

// Re-exports for convenience
pub use deposit::{DepositRecord, DepositStatus, LedgerStats};
