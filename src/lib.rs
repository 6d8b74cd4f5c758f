//! Deposit Airdrop Relay
//!
//! Watches one Solana address for inbound SOL transfers and pays each
//! depositor back in a Token-2022 token.
//!
//! ## Services
//!
//! 1. **Deposit Watcher** - Subscribes to the receiving address and records
//!    every confirmed inbound transfer exactly once
//! 2. **Settlement Batcher** - Periodically claims pending deposits and pays
//!    them out in multi-recipient transactions
//! 3. **Liveness Server** - Minimal HTTP endpoints for health checks
//!
//! ## Deposit Lifecycle
//!
//! pending → in_progress → settled, with failed payouts returning to pending.

pub mod api;
pub mod common;
pub mod settlement;
pub mod storage;
pub mod types;
pub mod watcher;

// Re-exports: Infrastructure
pub use common::{AppConfig, AppError, ConfigError};

// Re-exports: Ledger
pub use storage::{InsertOutcome, LedgerStore, MemoryLedgerStore, SqliteLedgerStore, StorageError};
pub use types::{DepositRecord, DepositStatus, LedgerStats};

// Re-exports: Watcher
pub use watcher::{
    DepositIngestor, DepositWatcher, Notification, ResolveError, ResolvedTransaction,
    RpcTransactionResolver, TransactionResolver, WatcherHandle,
};

// Re-exports: Settlement
pub use settlement::{
    BatcherConfig, PayoutStatus, PayoutTransfer, SettlementBatcher, SettlementRunReport,
    SignedPayout, Token2022Executor, TransferError, TransferExecutor,
};

// Re-exports: Units
pub use types::units;
