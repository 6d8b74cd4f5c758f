//! Deposit Watcher Module
//!
//! Observes the receiving address and records inbound transfers.
//!
//! # Components:
//! - `subscription`: websocket subscriptions with owned handles
//! - `notification`: tagged notification per subscription source
//! - `resolver`: transaction lookup over JSON-RPC
//! - `ingest`: acceptance rules and idempotent recording

pub mod ingest;
pub mod notification;
pub mod resolver;
pub mod subscription;

pub use ingest::{evaluate, DepositIngestor, IngestError, IngestOutcome, IngestReport, SkipReason};
pub use notification::Notification;
pub use resolver::{
    RecentSignature, ResolveError, ResolvedTransaction, RpcTransactionResolver, TransactionResolver,
};
pub use subscription::{DepositWatcher, SubscriptionHandle, SubscriptionKind, WatcherHandle};
