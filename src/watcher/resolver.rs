//! Transaction Resolver
//!
//! Looks up confirmed transactions by signature and reduces them to the
//! fields deposit acceptance needs.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};
use std::str::FromStr;
use thiserror::Error;

/// Resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("malformed transaction {signature}: {reason}")]
    Malformed { signature: String, reason: String },

    #[error("resolution timed out after {0}s")]
    Timeout(u64),
}

/// A signature touching the receiving address and the slot it landed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentSignature {
    pub signature: String,
    pub slot: u64,
}

/// Confirmed transaction reduced to sender, receiver and balances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransaction {
    pub signature: String,
    /// Account key 0 (fee payer)
    pub sender: String,
    /// Account key 1
    pub receiver: String,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub block_time: Option<i64>,
    pub failed: bool,
}

impl ResolvedTransaction {
    /// Lamports gained by the receiver (negative when it lost funds)
    ///
    /// None when the balance arrays do not cover account 1.
    pub fn received_lamports(&self) -> Option<i128> {
        let pre = *self.pre_balances.get(1)?;
        let post = *self.post_balances.get(1)?;
        Some(post as i128 - pre as i128)
    }

    /// Reduce an RPC transaction response
    pub fn from_encoded(
        signature: &str,
        tx: EncodedConfirmedTransactionWithStatusMeta,
    ) -> Result<Self, ResolveError> {
        let malformed = |reason: &str| ResolveError::Malformed {
            signature: signature.to_string(),
            reason: reason.to_string(),
        };

        let meta = tx
            .transaction
            .meta
            .ok_or_else(|| malformed("missing status meta"))?;
        let decoded = tx
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| malformed("undecodable transaction"))?;

        let keys = decoded.message.static_account_keys();
        if keys.len() < 2 {
            return Err(malformed("fewer than two account keys"));
        }

        Ok(Self {
            signature: signature.to_string(),
            sender: keys[0].to_string(),
            receiver: keys[1].to_string(),
            pre_balances: meta.pre_balances,
            post_balances: meta.post_balances,
            block_time: tx.block_time,
            failed: meta.err.is_some(),
        })
    }
}

/// Source of confirmed transaction data
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionResolver: Send + Sync {
    /// Fetch and reduce one transaction
    async fn resolve(&self, signature: &str) -> Result<ResolvedTransaction, ResolveError>;

    /// Most recent successful signatures touching `address`, newest first
    async fn recent_signatures(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<RecentSignature>, ResolveError>;

    /// Current slot at confirmed commitment
    async fn current_slot(&self) -> Result<u64, ResolveError>;
}

/// Resolver backed by the Solana JSON-RPC API
pub struct RpcTransactionResolver {
    rpc: RpcClient,
}

impl RpcTransactionResolver {
    pub fn new(rpc_url: &str) -> Self {
        Self {
            rpc: RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed()),
        }
    }
}

#[async_trait]
impl TransactionResolver for RpcTransactionResolver {
    async fn resolve(&self, signature: &str) -> Result<ResolvedTransaction, ResolveError> {
        let sig = Signature::from_str(signature)
            .map_err(|e| ResolveError::InvalidSignature(format!("{}: {}", signature, e)))?;

        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };

        let tx = self
            .rpc
            .get_transaction_with_config(&sig, config)
            .await
            .map_err(|e| ResolveError::Rpc(e.to_string()))?;

        ResolvedTransaction::from_encoded(signature, tx)
    }

    async fn recent_signatures(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<RecentSignature>, ResolveError> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until: None,
            limit: Some(limit),
            commitment: Some(CommitmentConfig::confirmed()),
        };

        let statuses = self
            .rpc
            .get_signatures_for_address_with_config(address, config)
            .await
            .map_err(|e| ResolveError::Rpc(e.to_string()))?;

        Ok(statuses
            .into_iter()
            .filter(|status| status.err.is_none())
            .map(|status| RecentSignature {
                signature: status.signature,
                slot: status.slot,
            })
            .collect())
    }

    async fn current_slot(&self) -> Result<u64, ResolveError> {
        self.rpc
            .get_slot()
            .await
            .map_err(|e| ResolveError::Rpc(e.to_string()))
    }
}
