//! Storage Trait Definitions
//!
//! Defines the ledger interface for deposit records.
//! Implementations can use SQLite (production) or in-memory (testing).

use async_trait::async_trait;
use thiserror::Error;

use crate::types::deposit::{DepositRecord, DepositStatus, LedgerStats};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {signature}: {from} -> {to}")]
    InvalidTransition {
        signature: String,
        from: DepositStatus,
        to: DepositStatus,
    },

    #[error("Payout already recorded for {0}")]
    PayoutAlreadyRecorded(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of an idempotent insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was stored
    Inserted,
    /// A record with the same signature already exists
    Duplicate,
}

/// Deposit ledger interface
///
/// Implementations:
/// - `SqliteLedgerStore` - Production storage with SQLite
/// - `MemoryLedgerStore` - In-memory storage for testing
///
/// Every mutation is durable before the call returns.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store a new deposit unless one with the same signature exists
    async fn insert_if_absent(&self, record: &DepositRecord) -> StorageResult<InsertOutcome>;

    /// Atomically move up to `limit` pending records to in_progress
    ///
    /// Records come back oldest first. Concurrent callers never receive the
    /// same record.
    async fn claim_pending(&self, limit: usize) -> StorageResult<Vec<DepositRecord>>;

    /// Attach a signed payout to every record of a group before submission
    ///
    /// All or nothing: fails unless every record is in_progress with no payout
    /// attached yet.
    async fn record_payout(
        &self,
        signatures: &[String],
        payout_signature: &str,
        valid_until: u64,
    ) -> StorageResult<()>;

    /// Mark a claimed record as paid out
    async fn mark_settled(&self, signature: &str, payout_signature: &str) -> StorageResult<()>;

    /// Return a claimed record to the pending pool
    async fn mark_failed(&self, signature: &str, reason: &str) -> StorageResult<()>;

    /// Get a record by signature
    async fn get(&self, signature: &str) -> StorageResult<Option<DepositRecord>>;

    /// Get all records with a specific status
    async fn get_by_status(&self, status: DepositStatus) -> StorageResult<Vec<DepositRecord>>;

    /// Get counts and totals by status
    async fn count_by_status(&self) -> StorageResult<LedgerStats>;
}

/// Reject records that must never reach the ledger
pub(crate) fn validate_new_record(record: &DepositRecord) -> StorageResult<()> {
    if record.signature.is_empty() {
        return Err(StorageError::InvalidData("empty signature".to_string()));
    }
    if record.amount == 0 {
        return Err(StorageError::InvalidData(format!(
            "zero amount for {}",
            record.signature
        )));
    }
    if record.status != DepositStatus::Pending {
        return Err(StorageError::InvalidData(format!(
            "new record {} must be pending, got {}",
            record.signature, record.status
        )));
    }
    Ok(())
}
