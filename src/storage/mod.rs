//! Storage Layer Module
//!
//! Provides persistence for deposit records.
//!
//! This module contains:
//! - The ledger trait shared by the watcher and the settlement batcher
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;
pub use traits::{InsertOutcome, LedgerStore, StorageError, StorageResult};
