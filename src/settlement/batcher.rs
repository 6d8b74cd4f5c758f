//! Settlement Batcher
//!
//! Periodically claims pending deposits and pays them out in groups.
//!
//! # Flow:
//! 1. `claim_pending(claim_limit)` moves records to in_progress
//! 2. Claimed records are split into groups of `batch_size`
//! 3. Each group becomes one signed multi-recipient transfer. Its signature
//!    is stored on the records before submission
//! 4. Success settles every record of the group, a rejected or expired payout
//!    returns every record to pending for the next run
//! 5. A payout whose fate is unknown (timeout, RPC error) keeps its records
//!    in_progress. Every later run looks it up again until it either lands
//!    or its blockhash expires
//!
//! Runs never overlap. A trigger that fires while a run is in flight is
//! skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::executor::{PayoutStatus, PayoutTransfer, TransferError, TransferExecutor};
use crate::common::logging::log_settlement_event;
use crate::storage::{LedgerStore, StorageError};
use crate::types::{DepositRecord, DepositStatus};

/// Batcher configuration
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Period between runs
    pub interval: Duration,
    /// Recipients per payout transaction
    pub batch_size: usize,
    /// Records claimed per run
    pub claim_limit: usize,
    /// Bound on one payout submission and confirmation
    pub transfer_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 10,
            claim_limit: 100,
            transfer_timeout: Duration::from_secs(90),
        }
    }
}

impl BatcherConfig {
    /// Build from application config
    pub fn from_app_config(config: &crate::common::config::AppConfig) -> Self {
        Self {
            interval: config.settlement_interval,
            batch_size: config.batch_size,
            claim_limit: config.claim_limit,
            transfer_timeout: config.transfer_timeout,
        }
    }
}

/// Result of one settlement run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SettlementRunReport {
    /// Another run was in flight, nothing was done
    pub skipped: bool,
    pub claimed: usize,
    pub groups: usize,
    pub settled: usize,
    pub failed: usize,
    /// Records whose payout is signed but not known to have landed
    pub unconfirmed: usize,
    /// Interrupted claims returned to pending
    pub recovered: usize,
    /// Records whose final status update did not persist
    pub storage_errors: usize,
    pub settled_amount: u64,
    pub failed_amount: u64,
    pub payout_signatures: Vec<String>,
}

impl SettlementRunReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn has_activity(&self) -> bool {
        self.claimed > 0
            || self.settled > 0
            || self.failed > 0
            || self.unconfirmed > 0
            || self.recovered > 0
    }
}

impl std::fmt::Display for SettlementRunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return write!(f, "skipped (run in progress)");
        }
        write!(
            f,
            "claimed: {}, groups: {}, settled: {} ({} lamports), failed: {} ({} lamports), unconfirmed: {}",
            self.claimed,
            self.groups,
            self.settled,
            self.settled_amount,
            self.failed,
            self.failed_amount,
            self.unconfirmed
        )?;
        if self.recovered > 0 {
            write!(f, ", recovered: {}", self.recovered)?;
        }
        Ok(())
    }
}

/// Claims pending deposits and pays them out
pub struct SettlementBatcher {
    store: Arc<dyn LedgerStore>,
    executor: Arc<dyn TransferExecutor>,
    config: BatcherConfig,
    run_lock: Mutex<()>,
}

impl SettlementBatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        executor: Arc<dyn TransferExecutor>,
        config: BatcherConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config: BatcherConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            run_lock: Mutex::new(()),
        }
    }

    /// Run one settlement pass
    ///
    /// Payouts left in flight by earlier runs are looked up first. Only a
    /// failed ledger read or claim is an error. Group failures are reported
    /// and their records go back to pending.
    pub async fn run_once(&self) -> Result<SettlementRunReport, StorageError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Settlement run already in progress, skipping");
                return Ok(SettlementRunReport::skipped());
            }
        };

        let mut report = SettlementRunReport::default();
        self.reconcile_in_flight(&mut report).await?;

        let claimed = self.store.claim_pending(self.config.claim_limit).await?;
        report.claimed = claimed.len();

        for group in claimed.chunks(self.config.batch_size) {
            report.groups += 1;
            self.settle_group(group, &mut report).await;
        }

        Ok(report)
    }

    /// Bring records left in_progress by a previous process back in line
    ///
    /// Claims that never got a signed payout return to pending, since nothing
    /// was submitted for them. Signed payouts are looked up on chain.
    pub async fn recover_interrupted(&self) -> Result<SettlementRunReport, StorageError> {
        let _guard = self.run_lock.lock().await;
        let mut report = SettlementRunReport::default();

        let unsigned: Vec<DepositRecord> = self
            .store
            .get_by_status(DepositStatus::InProgress)
            .await?
            .into_iter()
            .filter(|r| r.payout_signature.is_none())
            .collect();

        for record in &unsigned {
            match self
                .store
                .mark_failed(&record.signature, "claim interrupted before payout was signed")
                .await
            {
                Ok(()) => report.recovered += 1,
                Err(e) => {
                    error!(signature = %record.signature, error = %e, "Interrupted claim could not be released");
                    report.storage_errors += 1;
                }
            }
        }
        if !unsigned.is_empty() {
            warn!(count = report.recovered, "Released claims interrupted before signing");
        }

        self.reconcile_in_flight(&mut report).await?;
        Ok(report)
    }

    /// Look up every payout still in flight and settle or release its records
    async fn reconcile_in_flight(&self, report: &mut SettlementRunReport) -> Result<(), StorageError> {
        let mut payouts: BTreeMap<(String, u64), Vec<DepositRecord>> = BTreeMap::new();
        for record in self.store.get_by_status(DepositStatus::InProgress).await? {
            if let Some(payout) = record.payout_signature.clone() {
                let valid_until = record.payout_valid_until.unwrap_or_default();
                payouts.entry((payout, valid_until)).or_default().push(record);
            }
        }

        for ((payout, valid_until), group) in payouts {
            debug!(payout = %payout, deposits = group.len(), "Checking payout in flight");
            self.resolve_payout(&group, &payout, valid_until, None, report)
                .await;
        }
        Ok(())
    }

    async fn settle_group(&self, group: &[DepositRecord], report: &mut SettlementRunReport) {
        let transfers: Vec<PayoutTransfer> = group
            .iter()
            .map(|record| PayoutTransfer::new(record.sender.clone(), record.amount))
            .collect();
        let signatures: Vec<String> = group.iter().map(|r| r.signature.clone()).collect();
        let total = group_total(group);
        let started = Instant::now();

        // Nothing is on chain until the payout is signed and recorded
        let prepared = tokio::time::timeout(
            self.config.transfer_timeout,
            self.executor.prepare(&transfers),
        )
        .await
        .unwrap_or_else(|_| Err(TransferError::Timeout(self.config.transfer_timeout.as_secs())));

        let payout = match prepared {
            Ok(payout) => payout,
            Err(e) => {
                let reason = e.to_string();
                self.fail_records(group, &reason, report).await;
                log_settlement_event(
                    "group_failed",
                    &signatures,
                    total,
                    None,
                    elapsed_ms(started),
                    Some(&reason),
                );
                return;
            }
        };

        if let Err(e) = self
            .store
            .record_payout(&signatures, &payout.signature, payout.last_valid_block_height)
            .await
        {
            error!(payout = %payout.signature, error = %e, "Payout could not be recorded, not submitting");
            let reason = format!("payout not recorded: {}", e);
            self.release_unsigned(group, &reason, report).await;
            log_settlement_event(
                "group_failed",
                &signatures,
                total,
                None,
                elapsed_ms(started),
                Some(&reason),
            );
            return;
        }

        let submitted = tokio::time::timeout(
            self.config.transfer_timeout,
            self.executor.submit(&payout),
        )
        .await
        .unwrap_or_else(|_| Err(TransferError::Timeout(self.config.transfer_timeout.as_secs())));

        match submitted {
            Ok(()) => {
                self.settle_records(group, &payout.signature, report).await;
                log_settlement_event(
                    "group_settled",
                    &signatures,
                    total,
                    Some(&payout.signature),
                    elapsed_ms(started),
                    None,
                );
            }
            Err(e) => {
                warn!(
                    payout = %payout.signature,
                    error = %e,
                    "Payout submission did not confirm, checking its status"
                );
                let cause = e.to_string();
                self.resolve_payout(
                    group,
                    &payout.signature,
                    payout.last_valid_block_height,
                    Some(&cause),
                    report,
                )
                .await;
            }
        }
    }

    /// Settle, release or keep a group depending on its payout's fate
    async fn resolve_payout(
        &self,
        group: &[DepositRecord],
        payout: &str,
        valid_until: u64,
        cause: Option<&str>,
        report: &mut SettlementRunReport,
    ) {
        let signatures: Vec<String> = group.iter().map(|r| r.signature.clone()).collect();
        let total = group_total(group);
        let started = Instant::now();

        let status = tokio::time::timeout(
            self.config.transfer_timeout,
            self.executor.payout_status(payout, valid_until),
        )
        .await
        .unwrap_or_else(|_| Err(TransferError::Timeout(self.config.transfer_timeout.as_secs())));

        let reason = match status {
            Ok(PayoutStatus::Confirmed) => {
                self.settle_records(group, payout, report).await;
                log_settlement_event(
                    "group_settled",
                    &signatures,
                    total,
                    Some(payout),
                    elapsed_ms(started),
                    None,
                );
                return;
            }
            Ok(PayoutStatus::Failed(err)) => format!("payout failed on chain: {}", err),
            Ok(PayoutStatus::Expired) => match cause {
                Some(cause) => format!("{}; payout expired", cause),
                None => "payout expired before landing".to_string(),
            },
            Ok(PayoutStatus::Pending) => {
                warn!(payout = %payout, deposits = group.len(), "Payout may still land, keeping deposits in progress");
                report.unconfirmed += group.len();
                return;
            }
            Err(e) => {
                warn!(payout = %payout, error = %e, "Payout status unknown, keeping deposits in progress");
                report.unconfirmed += group.len();
                return;
            }
        };

        self.fail_records(group, &reason, report).await;
        log_settlement_event(
            "group_failed",
            &signatures,
            total,
            Some(payout),
            elapsed_ms(started),
            Some(&reason),
        );
    }

    async fn settle_records(
        &self,
        group: &[DepositRecord],
        payout: &str,
        report: &mut SettlementRunReport,
    ) {
        for record in group {
            match self.store.mark_settled(&record.signature, payout).await {
                Ok(()) => {
                    report.settled += 1;
                    report.settled_amount = report.settled_amount.saturating_add(record.amount);
                }
                Err(e) => {
                    // The payout went through, so the record must not be retried.
                    error!(
                        signature = %record.signature,
                        payout = %payout,
                        error = %e,
                        "Paid deposit could not be marked settled"
                    );
                    report.storage_errors += 1;
                }
            }
        }
        report.payout_signatures.push(payout.to_string());
    }

    async fn fail_records(
        &self,
        group: &[DepositRecord],
        reason: &str,
        report: &mut SettlementRunReport,
    ) {
        for record in group {
            match self.store.mark_failed(&record.signature, reason).await {
                Ok(()) => {
                    report.failed += 1;
                    report.failed_amount = report.failed_amount.saturating_add(record.amount);
                }
                Err(e) => {
                    error!(
                        signature = %record.signature,
                        error = %e,
                        "Failed deposit could not be returned to pending"
                    );
                    report.storage_errors += 1;
                }
            }
        }
    }

    /// Release only the records that carry no payout
    ///
    /// A record holding another payout's signature stays in flight.
    async fn release_unsigned(
        &self,
        group: &[DepositRecord],
        reason: &str,
        report: &mut SettlementRunReport,
    ) {
        for record in group {
            match self.store.get(&record.signature).await {
                Ok(Some(current))
                    if current.status == DepositStatus::InProgress
                        && current.payout_signature.is_none() =>
                {
                    self.fail_records(std::slice::from_ref(record), reason, report)
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(signature = %record.signature, error = %e, "Deposit could not be read back");
                    report.storage_errors += 1;
                }
            }
        }
    }

    /// Spawn the periodic loop, ending when `shutdown` flips to true
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_secs = self.config.interval.as_secs(),
                batch_size = self.config.batch_size,
                "Settlement batcher started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match self.run_once().await {
                    Ok(report) if report.has_activity() => {
                        info!("Settlement run: {}", report);
                        if let Ok(stats) = self.store.count_by_status().await {
                            info!("{}", stats);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Settlement run failed");
                    }
                }
            }

            info!("Settlement batcher stopped");
        })
    }
}

fn group_total(group: &[DepositRecord]) -> u64 {
    group
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.amount))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::executor::{MockTransferExecutor, SignedPayout};
    use crate::storage::MemoryLedgerStore;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::transaction::Transaction;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    async fn seed(store: &MemoryLedgerStore, amounts: &[u64]) -> Vec<String> {
        let mut signatures = Vec::new();
        for (i, amount) in amounts.iter().enumerate() {
            let signature = format!("sig{:03}", i);
            let record = DepositRecord::new(
                signature.clone(),
                Pubkey::new_unique().to_string(),
                *amount,
                1_700_000_000 + i as i64,
            );
            store.insert_if_absent(&record).await.unwrap();
            signatures.push(signature);
        }
        signatures
    }

    fn signed(signature: &str) -> SignedPayout {
        SignedPayout {
            signature: signature.to_string(),
            last_valid_block_height: 100,
            transaction: Transaction::default(),
        }
    }

    fn batcher(store: &MemoryLedgerStore, executor: MockTransferExecutor, batch_size: usize) -> SettlementBatcher {
        SettlementBatcher::new(
            Arc::new(store.clone()),
            Arc::new(executor),
            BatcherConfig {
                batch_size,
                transfer_timeout: Duration::from_millis(200),
                ..BatcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_small_set_is_one_group() {
        let store = MemoryLedgerStore::new();
        let signatures = seed(&store, &[5, 10, 15]).await;

        let mut executor = MockTransferExecutor::new();
        executor
            .expect_prepare()
            .withf(|transfers| {
                transfers.iter().map(|t| t.amount).collect::<Vec<_>>() == vec![5, 10, 15]
            })
            .times(1)
            .returning(|_| Ok(signed("payout1")));
        executor
            .expect_submit()
            .withf(|payout| payout.signature == "payout1")
            .times(1)
            .returning(|_| Ok(()));
        executor.expect_payout_status().never();

        let report = batcher(&store, executor, 10).run_once().await.unwrap();

        assert_eq!(report.claimed, 3);
        assert_eq!(report.groups, 1);
        assert_eq!(report.settled, 3);
        assert_eq!(report.settled_amount, 30);
        for signature in signatures {
            let record = store.get(&signature).await.unwrap().unwrap();
            assert_eq!(record.status, DepositStatus::Settled);
            assert_eq!(record.payout_signature.as_deref(), Some("payout1"));
        }
    }

    #[tokio::test]
    async fn test_groups_respect_batch_size() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[1; 25]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().returning(move |transfers| {
            assert!(transfers.len() <= 10);
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(signed(&format!("payout{}", n)))
        });
        executor.expect_submit().returning(|_| Ok(()));

        let report = batcher(&store, executor, 10).run_once().await.unwrap();

        assert_eq!(report.groups, 3);
        assert_eq!(report.settled, 25);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.payout_signatures.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_group_returns_to_pending() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[1, 2, 3, 4]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(signed(&format!("payout{}", n)))
        });
        executor.expect_submit().returning(|payout| {
            if payout.signature == "payout0" {
                Err(TransferError::Rpc("blockhash expired".to_string()))
            } else {
                Ok(())
            }
        });
        executor
            .expect_payout_status()
            .withf(|signature, _| signature == "payout0")
            .times(1)
            .returning(|_, _| Ok(PayoutStatus::Expired));

        let report = batcher(&store, executor, 2).run_once().await.unwrap();

        assert_eq!(report.groups, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.settled, 2);

        let pending = store.get_by_status(DepositStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        for record in &pending {
            assert_eq!(record.attempts, 1);
            assert!(record.payout_signature.is_none());
            assert!(record.last_error.as_deref().unwrap_or("").contains("blockhash expired"));
        }
        assert!(store.get_by_status(DepositStatus::InProgress).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_group_fails_without_status_lookup() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[4]).await;

        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().returning(|_| {
            Err(TransferError::InvalidRecipient {
                recipient: "x".to_string(),
                reason: "bad".to_string(),
            })
        });
        executor.expect_submit().never();
        executor.expect_payout_status().never();

        let report = batcher(&store, executor, 10).run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        let record = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(record.status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn test_submit_error_but_landed_settles() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[6]).await;

        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().returning(|_| Ok(signed("payout1")));
        executor
            .expect_submit()
            .returning(|_| Err(TransferError::Rpc("connection reset".to_string())));
        executor
            .expect_payout_status()
            .returning(|_, _| Ok(PayoutStatus::Confirmed));

        let report = batcher(&store, executor, 10).run_once().await.unwrap();

        assert_eq!(report.settled, 1);
        assert_eq!(report.failed, 0);
        let record = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(record.status, DepositStatus::Settled);
    }

    /// Executor whose payouts land on chain well after submission returns
    #[derive(Default)]
    struct LateLandingExecutor {
        landed: Arc<AtomicUsize>,
        expired: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TransferExecutor for LateLandingExecutor {
        async fn prepare(&self, transfers: &[PayoutTransfer]) -> Result<SignedPayout, TransferError> {
            Ok(signed(&format!("payout-{}", transfers[0].recipient)))
        }

        async fn submit(&self, _payout: &SignedPayout) -> Result<(), TransferError> {
            // The network keeps the transaction even when the caller gives up
            if !self.expired.load(Ordering::SeqCst) {
                let landed = self.landed.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    landed.fetch_add(1, Ordering::SeqCst);
                });
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn payout_status(
            &self,
            _signature: &str,
            _last_valid_block_height: u64,
        ) -> Result<PayoutStatus, TransferError> {
            if self.landed.load(Ordering::SeqCst) > 0 {
                Ok(PayoutStatus::Confirmed)
            } else if self.expired.load(Ordering::SeqCst) {
                Ok(PayoutStatus::Expired)
            } else {
                Ok(PayoutStatus::Pending)
            }
        }
    }

    fn late_batcher(store: &MemoryLedgerStore, executor: Arc<LateLandingExecutor>) -> SettlementBatcher {
        SettlementBatcher::new(
            Arc::new(store.clone()),
            executor,
            BatcherConfig {
                transfer_timeout: Duration::from_millis(50),
                ..BatcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_timed_out_payout_is_not_paid_twice() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[9]).await;
        let executor = Arc::new(LateLandingExecutor::default());
        let batcher = late_batcher(&store, executor.clone());

        let first = batcher.run_once().await.unwrap();
        assert_eq!(first.unconfirmed, 1);
        assert_eq!(first.failed, 0);
        let record = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(record.status, DepositStatus::InProgress);
        assert!(record.has_payout_in_flight());

        // The payout lands after the timeout
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = batcher.run_once().await.unwrap();
        assert_eq!(second.claimed, 0);
        assert_eq!(second.settled, 1);

        assert_eq!(executor.landed.load(Ordering::SeqCst), 1);
        let record = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(record.status, DepositStatus::Settled);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_expired_payout_returns_to_pending() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[9]).await;
        let executor = Arc::new(LateLandingExecutor::default());
        executor.expired.store(true, Ordering::SeqCst);
        let batcher = late_batcher(&store, executor.clone());

        let report = batcher.run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        let record = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(record.status, DepositStatus::Pending);
        assert!(record.last_error.unwrap().contains("timed out"));
        assert!(record.payout_signature.is_none());
        assert_eq!(executor.landed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[3]).await;

        let batcher = Arc::new(SettlementBatcher::new(
            Arc::new(store.clone()),
            Arc::new(LateLandingExecutor::default()),
            BatcherConfig {
                transfer_timeout: Duration::from_millis(300),
                ..BatcherConfig::default()
            },
        ));

        let first = tokio::spawn({
            let batcher = batcher.clone();
            async move { batcher.run_once().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = batcher.run_once().await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.to_string(), "skipped (run in progress)");

        let first = first.await.unwrap().unwrap();
        assert!(!first.skipped);
        assert_eq!(first.claimed, 1);
    }

    #[tokio::test]
    async fn test_recover_interrupted_claims() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[5, 10, 15]).await;

        // A previous process claimed everything, then signed one payout
        store.claim_pending(10).await.unwrap();
        store
            .record_payout(&["sig000".to_string()], "landed", 100)
            .await
            .unwrap();
        store
            .record_payout(&["sig001".to_string()], "lost", 100)
            .await
            .unwrap();

        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().never();
        executor
            .expect_payout_status()
            .returning(|signature, _| {
                if signature == "landed" {
                    Ok(PayoutStatus::Confirmed)
                } else {
                    Ok(PayoutStatus::Expired)
                }
            });

        let report = batcher(&store, executor, 10)
            .recover_interrupted()
            .await
            .unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.settled, 1);
        assert_eq!(report.failed, 1);
        assert!(report.has_activity());

        let landed = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(landed.status, DepositStatus::Settled);
        assert_eq!(landed.payout_signature.as_deref(), Some("landed"));
        for signature in ["sig001", "sig002"] {
            let record = store.get(signature).await.unwrap().unwrap();
            assert_eq!(record.status, DepositStatus::Pending);
        }
        assert!(store.get_by_status(DepositStatus::InProgress).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_ledger_is_quiet() {
        let store = MemoryLedgerStore::new();
        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().never();

        let report = batcher(&store, executor, 10).run_once().await.unwrap();
        assert!(!report.has_activity());
        assert_eq!(report.groups, 0);
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let store = MemoryLedgerStore::new();
        seed(&store, &[7]).await;

        let mut executor = MockTransferExecutor::new();
        executor.expect_prepare().returning(|_| Ok(signed("payout")));
        executor.expect_submit().returning(|_| Ok(()));

        let batcher = Arc::new(SettlementBatcher::new(
            Arc::new(store.clone()),
            Arc::new(executor),
            BatcherConfig {
                interval: Duration::from_millis(20),
                ..BatcherConfig::default()
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = batcher.start(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let record = store.get("sig000").await.unwrap().unwrap();
        assert_eq!(record.status, DepositStatus::Settled);
    }
}
