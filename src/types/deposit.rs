//! Deposit Types
//!
//! A deposit moves through a short lifecycle:
//! pending → in_progress → settled
//!
//! A failed payout sends the record from in_progress back to pending so the
//! next settlement run picks it up again. While a payout is in flight the
//! record carries its signature and the last block height at which it can
//! still land.

use serde::{Deserialize, Serialize};

/// Settlement status of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Observed on-chain, waiting for a settlement run
    Pending,
    /// Claimed by a settlement run, payout in flight
    InProgress,
    /// Payout confirmed
    Settled,
}

impl Default for DepositStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Settled => "settled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "settled" => Ok(Self::Settled),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// A single observed deposit into the receiving account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    /// Signature of the deposit transaction (natural key)
    pub signature: String,
    /// Depositor address, also the payout recipient
    pub sender: String,
    /// Lamports received
    pub amount: u64,
    /// Block time of the deposit (unix seconds)
    pub observed_at: i64,
    /// Current status
    pub status: DepositStatus,

    /// Signature of the payout transaction, set once it is signed
    pub payout_signature: Option<String>,
    /// Last block height at which the in-flight payout can land
    pub payout_valid_until: Option<u64>,
    /// Number of settlement runs that claimed this record
    pub attempts: u32,
    /// Last payout failure reason
    pub last_error: Option<String>,

    /// Timestamp when the record was stored
    pub created_at: u64,
    /// Timestamp of last status update
    pub updated_at: u64,
}

impl DepositRecord {
    /// Create a new pending deposit record
    pub fn new(signature: String, sender: String, amount: u64, observed_at: i64) -> Self {
        let now = unix_now();

        Self {
            signature,
            sender,
            amount,
            observed_at,
            status: DepositStatus::Pending,
            payout_signature: None,
            payout_valid_until: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a settlement run may claim this record
    pub fn is_claimable(&self) -> bool {
        self.status == DepositStatus::Pending
    }

    /// Mark as claimed by a settlement run
    pub fn mark_claimed(&mut self) {
        self.status = DepositStatus::InProgress;
        self.attempts += 1;
        self.touch();
    }

    /// Attach a signed payout before it is submitted
    pub fn record_payout(&mut self, payout_signature: String, valid_until: u64) {
        self.payout_signature = Some(payout_signature);
        self.payout_valid_until = Some(valid_until);
        self.touch();
    }

    /// Whether a signed payout may still be in flight
    pub fn has_payout_in_flight(&self) -> bool {
        self.status == DepositStatus::InProgress && self.payout_signature.is_some()
    }

    /// Mark payout confirmed
    pub fn mark_settled(&mut self, payout_signature: String) {
        self.status = DepositStatus::Settled;
        self.payout_signature = Some(payout_signature);
        self.payout_valid_until = None;
        self.last_error = None;
        self.touch();
    }

    /// Return to the pending pool after a failed payout
    pub fn mark_failed(&mut self, reason: String) {
        self.status = DepositStatus::Pending;
        self.payout_signature = None;
        self.payout_valid_until = None;
        self.last_error = Some(reason);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = unix_now();
    }
}

/// Ledger counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub settled: u64,
    /// Lamports received across all records
    pub total_lamports: u64,
    /// Lamports already paid out
    pub settled_lamports: u64,
}

impl std::fmt::Display for LedgerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Deposits: {} total | {} pending | {} in progress | {} settled | received {} | paid {}",
            self.total,
            self.pending,
            self.in_progress,
            self.settled,
            super::units::lamports_to_display(self.total_lamports),
            super::units::lamports_to_display(self.settled_lamports)
        )
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
