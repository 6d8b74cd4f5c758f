//! Deposit Ingestion
//!
//! Turns subscription notifications into PENDING ledger records.
//!
//! # Flow:
//! 1. A log entry names its signature; an account change triggers a lookup of
//!    the most recent signatures for the receiving address, keeping only those
//!    that landed between the watcher's start slot and the notification slot
//! 2. Each signature is resolved under a timeout
//! 3. Accepted transfers are stored with an idempotent insert
//!
//! Failures are logged and the notification is dropped. Nothing here ends the
//! consuming loop.

use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::notification::Notification;
use super::resolver::{RecentSignature, ResolveError, ResolvedTransaction, TransactionResolver};
use crate::common::logging::log_deposit_event;
use crate::storage::{InsertOutcome, LedgerStore, StorageError};
use crate::types::DepositRecord;

/// Ingestion errors
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Why a resolved transaction was not recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Transaction failed on chain
    TransactionFailed,
    /// Account key 1 is not the receiving address
    WrongReceiver(String),
    /// Receiver balance did not grow
    NonPositiveAmount(i128),
    /// Balance arrays do not cover the receiver
    MissingBalances,
    /// No block time available
    MissingBlockTime,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TransactionFailed => write!(f, "transaction failed"),
            SkipReason::WrongReceiver(receiver) => write!(f, "receiver is {}", receiver),
            SkipReason::NonPositiveAmount(amount) => write!(f, "received {} lamports", amount),
            SkipReason::MissingBalances => write!(f, "missing balances"),
            SkipReason::MissingBlockTime => write!(f, "missing block time"),
        }
    }
}

/// Result of ingesting one signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored(DepositRecord),
    Duplicate,
    Skipped(SkipReason),
}

/// Tally of one notification
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    /// Signatures (or lookups) abandoned after an error
    pub dropped: usize,
}

impl IngestReport {
    fn record(&mut self, result: &Result<IngestOutcome, IngestError>) {
        match result {
            Ok(IngestOutcome::Stored(_)) => self.stored += 1,
            Ok(IngestOutcome::Duplicate) => self.duplicates += 1,
            Ok(IngestOutcome::Skipped(_)) => self.skipped += 1,
            Err(_) => self.dropped += 1,
        }
    }
}

impl std::fmt::Display for IngestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stored: {}, duplicates: {}, skipped: {}, dropped: {}",
            self.stored, self.duplicates, self.skipped, self.dropped
        )
    }
}

/// Decide whether a resolved transaction is a deposit
pub fn evaluate(
    resolved: &ResolvedTransaction,
    receiving_address: &Pubkey,
) -> Result<DepositRecord, SkipReason> {
    if resolved.failed {
        return Err(SkipReason::TransactionFailed);
    }
    if resolved.receiver != receiving_address.to_string() {
        return Err(SkipReason::WrongReceiver(resolved.receiver.clone()));
    }

    let received = resolved
        .received_lamports()
        .ok_or(SkipReason::MissingBalances)?;
    if received <= 0 {
        return Err(SkipReason::NonPositiveAmount(received));
    }
    let amount = u64::try_from(received).map_err(|_| SkipReason::NonPositiveAmount(received))?;

    let block_time = resolved.block_time.ok_or(SkipReason::MissingBlockTime)?;

    Ok(DepositRecord::new(
        resolved.signature.clone(),
        resolved.sender.clone(),
        amount,
        block_time,
    ))
}

/// Converts notifications into ledger records
pub struct DepositIngestor {
    store: Arc<dyn LedgerStore>,
    resolver: Arc<dyn TransactionResolver>,
    receiving_address: Pubkey,
    resolve_timeout: Duration,
    signature_lookback: usize,
    /// Signatures from earlier slots predate the watcher
    min_slot: u64,
}

impl DepositIngestor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        resolver: Arc<dyn TransactionResolver>,
        receiving_address: Pubkey,
    ) -> Self {
        Self {
            store,
            resolver,
            receiving_address,
            resolve_timeout: Duration::from_secs(10),
            signature_lookback: 10,
            min_slot: 0,
        }
    }

    /// Set the per-lookup timeout
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Set how many signatures an account change looks back over
    pub fn with_signature_lookback(mut self, lookback: usize) -> Self {
        self.signature_lookback = lookback.max(1);
        self
    }

    /// Ignore looked-up signatures that landed before `slot`
    pub fn with_min_slot(mut self, slot: u64) -> Self {
        self.min_slot = slot;
        self
    }

    /// Process one notification
    pub async fn handle(&self, notification: &Notification) -> IngestReport {
        let mut report = IngestReport::default();

        let signatures = match notification {
            Notification::LogEntry { failed: true, signature, .. } => {
                debug!(signature = %signature, "Skipping failed transaction");
                report.skipped += 1;
                return report;
            }
            Notification::LogEntry { signature, .. } => vec![signature.clone()],
            Notification::AccountChange { slot } => {
                match self.lookup_recent_signatures().await {
                    Ok(recent) => self.within_window(recent, *slot),
                    Err(e) => {
                        warn!(slot = slot, error = %e, "Dropping account notification");
                        report.dropped += 1;
                        return report;
                    }
                }
            }
        };

        for signature in signatures {
            let result = self.ingest_signature(&signature).await;
            match &result {
                Ok(IngestOutcome::Stored(_)) => {}
                Ok(IngestOutcome::Duplicate) => {
                    debug!(signature = %signature, "Deposit already recorded");
                }
                Ok(IngestOutcome::Skipped(reason)) => {
                    debug!(signature = %signature, reason = %reason, "Not a deposit");
                }
                Err(e) => {
                    warn!(
                        signature = %signature,
                        source = notification.source(),
                        error = %e,
                        "Dropping notification"
                    );
                }
            }
            report.record(&result);
        }

        report
    }

    /// Resolve and record one signature
    pub async fn ingest_signature(&self, signature: &str) -> Result<IngestOutcome, IngestError> {
        let resolved = tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(signature))
            .await
            .map_err(|_| ResolveError::Timeout(self.resolve_timeout.as_secs()))??;

        let record = match evaluate(&resolved, &self.receiving_address) {
            Ok(record) => record,
            Err(reason) => return Ok(IngestOutcome::Skipped(reason)),
        };

        match self.store.insert_if_absent(&record).await? {
            InsertOutcome::Inserted => {
                info!(
                    signature = %record.signature,
                    sender = %record.sender,
                    lamports = record.amount,
                    "Deposit recorded"
                );
                log_deposit_event(
                    "deposit_recorded",
                    &record.signature,
                    &record.sender,
                    record.amount,
                );
                Ok(IngestOutcome::Stored(record))
            }
            InsertOutcome::Duplicate => Ok(IngestOutcome::Duplicate),
        }
    }

    /// Keep signatures landed between the start slot and `max_slot`
    fn within_window(&self, recent: Vec<RecentSignature>, max_slot: u64) -> Vec<String> {
        let total = recent.len();
        let kept: Vec<String> = recent
            .into_iter()
            .filter(|r| r.slot >= self.min_slot && r.slot <= max_slot)
            .map(|r| r.signature)
            .collect();
        if kept.len() < total {
            debug!(
                ignored = total - kept.len(),
                min_slot = self.min_slot,
                max_slot = max_slot,
                "Ignoring signatures outside the watch window"
            );
        }
        kept
    }

    async fn lookup_recent_signatures(&self) -> Result<Vec<RecentSignature>, ResolveError> {
        tokio::time::timeout(
            self.resolve_timeout,
            self.resolver
                .recent_signatures(&self.receiving_address, self.signature_lookback),
        )
        .await
        .map_err(|_| ResolveError::Timeout(self.resolve_timeout.as_secs()))?
    }

    /// Consume notifications until every sender is gone
    pub async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<Notification>) {
        while let Some(notification) = rx.recv().await {
            let report = self.handle(&notification).await;
            if report.stored > 0 || report.dropped > 0 {
                info!(
                    source = notification.source(),
                    slot = notification.slot(),
                    "Notification processed ({})",
                    report
                );
            }
        }
        debug!("Notification channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLedgerStore;
    use crate::types::DepositStatus;
    use crate::watcher::resolver::MockTransactionResolver;
    use mockall::predicate::eq;

    fn deposit(signature: &str, receiver: &Pubkey, pre: u64, post: u64) -> ResolvedTransaction {
        ResolvedTransaction {
            signature: signature.to_string(),
            sender: "Sender1111111111111111111111111111111111111".to_string(),
            receiver: receiver.to_string(),
            pre_balances: vec![10_000_000, pre],
            post_balances: vec![9_000_000, post],
            block_time: Some(1_700_000_000),
            failed: false,
        }
    }

    fn log_entry(signature: &str) -> Notification {
        Notification::LogEntry {
            signature: signature.to_string(),
            slot: 1,
            failed: false,
        }
    }

    fn recent(signature: &str, slot: u64) -> RecentSignature {
        RecentSignature {
            signature: signature.to_string(),
            slot,
        }
    }

    fn ingestor(
        store: &MemoryLedgerStore,
        resolver: MockTransactionResolver,
        address: Pubkey,
    ) -> DepositIngestor {
        DepositIngestor::new(Arc::new(store.clone()), Arc::new(resolver), address)
            .with_resolve_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_evaluate_rules() {
        let address = Pubkey::new_unique();

        let record = evaluate(&deposit("a", &address, 100, 600), &address).unwrap();
        assert_eq!(record.amount, 500);
        assert_eq!(record.observed_at, 1_700_000_000);
        assert_eq!(record.status, DepositStatus::Pending);

        let mut failed = deposit("b", &address, 0, 10);
        failed.failed = true;
        assert_eq!(evaluate(&failed, &address), Err(SkipReason::TransactionFailed));

        let other = Pubkey::new_unique();
        assert!(matches!(
            evaluate(&deposit("c", &other, 0, 10), &address),
            Err(SkipReason::WrongReceiver(_))
        ));

        assert_eq!(
            evaluate(&deposit("d", &address, 10, 10), &address),
            Err(SkipReason::NonPositiveAmount(0))
        );
        assert_eq!(
            evaluate(&deposit("e", &address, 10, 4), &address),
            Err(SkipReason::NonPositiveAmount(-6))
        );

        let mut no_time = deposit("f", &address, 0, 10);
        no_time.block_time = None;
        assert_eq!(evaluate(&no_time, &address), Err(SkipReason::MissingBlockTime));
    }

    #[tokio::test]
    async fn test_log_entry_stored_once() {
        let address = Pubkey::new_unique();
        let store = MemoryLedgerStore::new();

        let mut resolver = MockTransactionResolver::new();
        let tx = deposit("sig1", &address, 0, 1_000);
        resolver
            .expect_resolve()
            .with(eq("sig1"))
            .times(2)
            .returning(move |_| Ok(tx.clone()));

        let ingestor = ingestor(&store, resolver, address);

        let first = ingestor.handle(&log_entry("sig1")).await;
        assert_eq!(first.stored, 1);

        let second = ingestor.handle(&log_entry("sig1")).await;
        assert_eq!(second.duplicates, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_log_entry_skips_lookup() {
        let store = MemoryLedgerStore::new();
        let mut resolver = MockTransactionResolver::new();
        resolver.expect_resolve().never();

        let ingestor = ingestor(&store, resolver, Pubkey::new_unique());
        let report = ingestor
            .handle(&Notification::LogEntry {
                signature: "bad".to_string(),
                slot: 3,
                failed: true,
            })
            .await;

        assert_eq!(report.skipped, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_account_change_looks_back() {
        let address = Pubkey::new_unique();
        let store = MemoryLedgerStore::new();

        let mut resolver = MockTransactionResolver::new();
        resolver
            .expect_recent_signatures()
            .with(eq(address), eq(3usize))
            .times(1)
            .returning(|_, _| Ok(vec![recent("new", 9), recent("old", 8), recent("out", 7)]));

        let txs = vec![
            deposit("new", &address, 500, 900),
            deposit("old", &address, 0, 500),
            deposit("out", &address, 900, 100),
        ];
        resolver.expect_resolve().returning(move |sig| {
            txs.iter()
                .find(|tx| tx.signature == sig)
                .cloned()
                .ok_or_else(|| ResolveError::Rpc("unknown".to_string()))
        });

        let ingestor = ingestor(&store, resolver, address).with_signature_lookback(3);
        let report = ingestor.handle(&Notification::AccountChange { slot: 9 }).await;

        assert_eq!(report.stored, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.get("new").await.unwrap().unwrap().amount, 400);
        assert!(store.get("out").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_account_change_ignores_history() {
        let address = Pubkey::new_unique();
        let store = MemoryLedgerStore::new();

        let mut resolver = MockTransactionResolver::new();
        resolver.expect_recent_signatures().returning(|_, _| {
            Ok(vec![
                recent("later", 300_000_005),
                recent("current", 300_000_000),
                recent("ancient", 70_000_000),
            ])
        });

        let mut ancient = deposit("ancient", &address, 0, 5_000);
        ancient.block_time = Some(1_600_000_000);
        let txs = vec![deposit("current", &address, 0, 250), ancient];
        resolver.expect_resolve().returning(move |sig| {
            txs.iter()
                .find(|tx| tx.signature == sig)
                .cloned()
                .ok_or_else(|| ResolveError::Rpc("unknown".to_string()))
        });

        let ingestor = ingestor(&store, resolver, address).with_min_slot(299_999_000);
        let report = ingestor
            .handle(&Notification::AccountChange { slot: 300_000_000 })
            .await;

        assert_eq!(report.stored, 1);
        assert!(store.get("current").await.unwrap().is_some());
        assert!(store.get("ancient").await.unwrap().is_none());
        assert!(store.get("later").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolution_error_drops_notification() {
        let store = MemoryLedgerStore::new();
        let mut resolver = MockTransactionResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Err(ResolveError::Rpc("node unavailable".to_string())));
        resolver
            .expect_recent_signatures()
            .returning(|_, _| Err(ResolveError::Rpc("node unavailable".to_string())));

        let ingestor = ingestor(&store, resolver, Pubkey::new_unique());

        assert_eq!(ingestor.handle(&log_entry("x")).await.dropped, 1);
        assert_eq!(
            ingestor.handle(&Notification::AccountChange { slot: 1 }).await.dropped,
            1
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_consume_survives_errors() {
        let address = Pubkey::new_unique();
        let store = MemoryLedgerStore::new();

        let mut resolver = MockTransactionResolver::new();
        let good = deposit("good", &address, 0, 77);
        resolver.expect_resolve().returning(move |sig| {
            if sig == "good" {
                Ok(good.clone())
            } else {
                Err(ResolveError::Rpc("boom".to_string()))
            }
        });

        let ingestor = Arc::new(ingestor(&store, resolver, address));
        let (tx, rx) = mpsc::channel(8);
        tx.send(log_entry("bad")).await.unwrap();
        tx.send(log_entry("good")).await.unwrap();
        drop(tx);

        ingestor.consume(rx).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("good").await.unwrap().unwrap().amount, 77);
    }
}
