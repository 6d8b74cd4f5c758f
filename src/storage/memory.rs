//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the service restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{validate_new_record, InsertOutcome, LedgerStore, StorageError, StorageResult};
use crate::types::deposit::{DepositRecord, DepositStatus, LedgerStats};

/// In-memory deposit ledger
///
/// Thread-safe storage for deposit records.
/// Claims happen under the write lock, which makes them atomic.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    /// Records indexed by signature
    records: Arc<RwLock<HashMap<String, DepositRecord>>>,
}

impl MemoryLedgerStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn finish_claim(
        &self,
        signature: &str,
        to: DepositStatus,
        apply: impl FnOnce(&mut DepositRecord),
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(signature)
            .ok_or_else(|| StorageError::NotFound(signature.to_string()))?;

        if record.status != DepositStatus::InProgress {
            return Err(StorageError::InvalidTransition {
                signature: signature.to_string(),
                from: record.status,
                to,
            });
        }

        apply(record);
        Ok(())
    }
}

fn sorted_by_observation(mut records: Vec<DepositRecord>) -> Vec<DepositRecord> {
    records.sort_by(|a, b| {
        a.observed_at
            .cmp(&b.observed_at)
            .then_with(|| a.signature.cmp(&b.signature))
    });
    records
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_if_absent(&self, record: &DepositRecord) -> StorageResult<InsertOutcome> {
        validate_new_record(record)?;
        let mut records = self.records.write().await;

        if records.contains_key(&record.signature) {
            return Ok(InsertOutcome::Duplicate);
        }

        records.insert(record.signature.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn claim_pending(&self, limit: usize) -> StorageResult<Vec<DepositRecord>> {
        let mut records = self.records.write().await;

        let pending = records
            .values()
            .filter(|r| r.is_claimable())
            .cloned()
            .collect();

        let mut claimed: Vec<DepositRecord> = sorted_by_observation(pending)
            .into_iter()
            .take(limit)
            .collect();

        for record in claimed.iter_mut() {
            record.mark_claimed();
            records.insert(record.signature.clone(), record.clone());
        }

        Ok(claimed)
    }

    async fn record_payout(
        &self,
        signatures: &[String],
        payout_signature: &str,
        valid_until: u64,
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;

        for signature in signatures {
            let record = records
                .get(signature)
                .ok_or_else(|| StorageError::NotFound(signature.clone()))?;
            if record.status != DepositStatus::InProgress {
                return Err(StorageError::InvalidTransition {
                    signature: signature.clone(),
                    from: record.status,
                    to: DepositStatus::InProgress,
                });
            }
            if record.payout_signature.is_some() {
                return Err(StorageError::PayoutAlreadyRecorded(signature.clone()));
            }
        }

        for signature in signatures {
            if let Some(record) = records.get_mut(signature) {
                record.record_payout(payout_signature.to_string(), valid_until);
            }
        }
        Ok(())
    }

    async fn mark_settled(&self, signature: &str, payout_signature: &str) -> StorageResult<()> {
        self.finish_claim(signature, DepositStatus::Settled, |record| {
            record.mark_settled(payout_signature.to_string())
        })
        .await
    }

    async fn mark_failed(&self, signature: &str, reason: &str) -> StorageResult<()> {
        self.finish_claim(signature, DepositStatus::Pending, |record| {
            record.mark_failed(reason.to_string())
        })
        .await
    }

    async fn get(&self, signature: &str) -> StorageResult<Option<DepositRecord>> {
        Ok(self.records.read().await.get(signature).cloned())
    }

    async fn get_by_status(&self, status: DepositStatus) -> StorageResult<Vec<DepositRecord>> {
        let records = self.records.read().await;
        let matching = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        Ok(sorted_by_observation(matching))
    }

    async fn count_by_status(&self) -> StorageResult<LedgerStats> {
        let records = self.records.read().await;

        let mut stats = LedgerStats::default();
        for record in records.values() {
            stats.total += 1;
            stats.total_lamports += record.amount;
            match record.status {
                DepositStatus::Pending => stats.pending += 1,
                DepositStatus::InProgress => stats.in_progress += 1,
                DepositStatus::Settled => {
                    stats.settled += 1;
                    stats.settled_lamports += record.amount;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn record(signature: &str, amount: u64, observed_at: i64) -> DepositRecord {
        DepositRecord::new(signature.to_string(), "sender".to_string(), amount, observed_at)
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let store = MemoryLedgerStore::new();

        assert_eq!(
            store.insert_if_absent(&record("sig1", 10, 1)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&record("sig1", 10, 1)).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_then_settle() {
        let store = MemoryLedgerStore::new();
        store.insert_if_absent(&record("b", 10, 2)).await.unwrap();
        store.insert_if_absent(&record("a", 10, 1)).await.unwrap();

        let claimed = store.claim_pending(10).await.unwrap();
        assert_eq!(claimed[0].signature, "a");
        assert_eq!(claimed[1].signature, "b");

        store.mark_settled("a", "payout").await.unwrap();
        store.mark_failed("b", "boom").await.unwrap();

        let settled = store.get_by_status(DepositStatus::Settled).await.unwrap();
        assert_eq!(settled.len(), 1);
        let pending = store.get_by_status(DepositStatus::Pending).await.unwrap();
        assert_eq!(pending[0].signature, "b");

        // A settled record cannot be reverted
        let result = store.mark_failed("a", "late failure").await;
        assert!(matches!(result, Err(StorageError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_record_payout_is_all_or_nothing() {
        let store = MemoryLedgerStore::new();
        store.insert_if_absent(&record("a", 10, 1)).await.unwrap();
        store.insert_if_absent(&record("b", 10, 2)).await.unwrap();
        store.claim_pending(1).await.unwrap();

        // "b" is still pending, so nothing is attached
        let group = vec!["a".to_string(), "b".to_string()];
        let result = store.record_payout(&group, "payout", 900).await;
        assert!(matches!(result, Err(StorageError::InvalidTransition { .. })));
        assert!(store.get("a").await.unwrap().unwrap().payout_signature.is_none());

        let only_a = vec!["a".to_string()];
        store.record_payout(&only_a, "payout", 900).await.unwrap();
        let a = store.get("a").await.unwrap().unwrap();
        assert!(a.has_payout_in_flight());
        assert_eq!(a.payout_valid_until, Some(900));

        let again = store.record_payout(&only_a, "other", 950).await;
        assert!(matches!(again, Err(StorageError::PayoutAlreadyRecorded(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_do_not_overlap() {
        let store = MemoryLedgerStore::new();
        for i in 0..40 {
            store.insert_if_absent(&record(&format!("sig{}", i), 1, i)).await.unwrap();
        }

        let (left, right) = tokio::join!(
            tokio::spawn({
                let store = store.clone();
                async move { store.claim_pending(25).await.unwrap() }
            }),
            tokio::spawn({
                let store = store.clone();
                async move { store.claim_pending(25).await.unwrap() }
            }),
        );

        let left: HashSet<_> = left.unwrap().into_iter().map(|r| r.signature).collect();
        let right: HashSet<_> = right.unwrap().into_iter().map(|r| r.signature).collect();

        assert!(left.is_disjoint(&right));
        assert_eq!(left.len() + right.len(), 40);
    }
}
