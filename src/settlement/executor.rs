//! Token-2022 Payout Executor
//!
//! Builds one transaction per payout group. For every recipient:
//! 1. `CreateIdempotent` for the recipient's associated token account
//! 2. `TransferChecked` from the operator's associated token account
//!
//! Every recipient is validated before anything is built, so a single bad
//! address fails the whole group without touching the chain.
//!
//! Signing and submission are separate steps. The payout signature and the
//! last block height at which it can land are known before anything is sent,
//! so a payout whose fate is unclear can be looked up later instead of being
//! paid again.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer as SolanaSigner},
    transaction::Transaction,
};
use solana_transaction_status::TransactionStatus;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Constants
// ============================================================================

/// Token-2022 program ID
pub const TOKEN_2022_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb");

/// Associated Token Account program ID
pub const ATA_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Associated token account instruction tag for `CreateIdempotent`
const ATA_CREATE_IDEMPOTENT: u8 = 1;

/// Token instruction tag for `TransferChecked`
const TOKEN_TRANSFER_CHECKED: u8 = 12;

// ============================================================================
// Types
// ============================================================================

/// One recipient of a payout group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutTransfer {
    /// Base58 wallet address
    pub recipient: String,
    /// Token base units
    pub amount: u64,
}

impl PayoutTransfer {
    pub fn new(recipient: impl Into<String>, amount: u64) -> Self {
        Self {
            recipient: recipient.into(),
            amount,
        }
    }
}

/// A payout transaction, signed but not necessarily sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayout {
    /// First signature of the transaction
    pub signature: String,
    /// Last block height at which the transaction can land
    pub last_valid_block_height: u64,
    pub transaction: Transaction,
}

/// On-chain fate of a signed payout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutStatus {
    /// Landed without error at confirmed commitment
    Confirmed,
    /// Landed with an error, nothing was transferred
    Failed(String),
    /// Not confirmed yet and its blockhash is still valid
    Pending,
    /// Never seen and its blockhash expired, so it can no longer land
    Expired,
}

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("empty payout group")]
    EmptyBatch,

    #[error("invalid recipient {recipient}: {reason}")]
    InvalidRecipient { recipient: String, reason: String },

    #[error("invalid payout signature {0}")]
    InvalidSignature(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("transfer timed out after {0}s")]
    Timeout(u64),
}

/// Signs, submits and tracks payout groups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Build and sign one transaction paying every recipient
    async fn prepare(&self, transfers: &[PayoutTransfer]) -> Result<SignedPayout, TransferError>;

    /// Send a signed payout and wait for confirmation
    async fn submit(&self, payout: &SignedPayout) -> Result<(), TransferError>;

    /// Look up a previously signed payout
    async fn payout_status(
        &self,
        signature: &str,
        last_valid_block_height: u64,
    ) -> Result<PayoutStatus, TransferError>;
}

// ============================================================================
// Instruction Builders
// ============================================================================

/// Compute associated token address for Token-2022
pub fn get_ata(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_2022_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_ID,
    )
    .0
}

/// Create `owner`'s associated token account unless it already exists
pub fn create_ata_idempotent(payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
    let ata = get_ata(owner, mint);

    Instruction {
        program_id: ATA_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(ata, false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(solana_sdk::system_program::ID, false),
            AccountMeta::new_readonly(TOKEN_2022_PROGRAM_ID, false),
        ],
        data: vec![ATA_CREATE_IDEMPOTENT],
    }
}

/// Token-2022 `TransferChecked` between two associated token accounts
pub fn transfer_checked(
    authority: &Pubkey,
    recipient: &Pubkey,
    mint: &Pubkey,
    amount: u64,
    decimals: u8,
) -> Instruction {
    let source = get_ata(authority, mint);
    let destination = get_ata(recipient, mint);

    let mut data = Vec::with_capacity(1 + 8 + 1);
    data.push(TOKEN_TRANSFER_CHECKED);
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(decimals);

    Instruction {
        program_id: TOKEN_2022_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(source, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new(destination, false),
            AccountMeta::new_readonly(*authority, true),
        ],
        data,
    }
}

/// Parse every recipient, failing on the first malformed one
pub fn validate_recipients(transfers: &[PayoutTransfer]) -> Result<Vec<Pubkey>, TransferError> {
    if transfers.is_empty() {
        return Err(TransferError::EmptyBatch);
    }

    transfers
        .iter()
        .map(|t| {
            Pubkey::from_str(&t.recipient).map_err(|e| TransferError::InvalidRecipient {
                recipient: t.recipient.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// All instructions for one payout group
pub fn build_payout_instructions(
    authority: &Pubkey,
    mint: &Pubkey,
    decimals: u8,
    transfers: &[PayoutTransfer],
) -> Result<Vec<Instruction>, TransferError> {
    let recipients = validate_recipients(transfers)?;

    let mut instructions = Vec::with_capacity(recipients.len() * 2);
    for (recipient, transfer) in recipients.iter().zip(transfers) {
        instructions.push(create_ata_idempotent(authority, recipient, mint));
        instructions.push(transfer_checked(
            authority,
            recipient,
            mint,
            transfer.amount,
            decimals,
        ));
    }
    Ok(instructions)
}

/// Sign a payout transaction with the operator key as fee payer
pub fn sign_payout(
    payer: &Keypair,
    instructions: &[Instruction],
    recent_blockhash: Hash,
    last_valid_block_height: u64,
) -> SignedPayout {
    let transaction = Transaction::new_signed_with_payer(
        instructions,
        Some(&payer.pubkey()),
        &[payer],
        recent_blockhash,
    );

    SignedPayout {
        signature: transaction.signatures[0].to_string(),
        last_valid_block_height,
        transaction,
    }
}

/// Decide a payout's fate from its status and the current block height
///
/// `block_height` must be read before `status`. A payout unseen after its
/// last valid block height can never land.
pub fn classify_status(
    status: Option<&TransactionStatus>,
    block_height: u64,
    last_valid_block_height: u64,
) -> PayoutStatus {
    match status {
        Some(status) => match &status.err {
            Some(err) => PayoutStatus::Failed(err.to_string()),
            None if status.satisfies_commitment(CommitmentConfig::confirmed()) => {
                PayoutStatus::Confirmed
            }
            None => PayoutStatus::Pending,
        },
        None if block_height > last_valid_block_height => PayoutStatus::Expired,
        None => PayoutStatus::Pending,
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Pays out a Token-2022 mint from the operator's associated token account
pub struct Token2022Executor {
    rpc: RpcClient,
    payer: Keypair,
    mint: Pubkey,
    decimals: u8,
}

impl Token2022Executor {
    pub fn new(rpc_url: &str, payer: Keypair, mint: Pubkey, decimals: u8) -> Self {
        Self {
            rpc: RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed()),
            payer,
            mint,
            decimals,
        }
    }

    /// Operator public key
    pub fn payer_pubkey(&self) -> Pubkey {
        self.payer.pubkey()
    }

    /// Operator associated token account funding the payouts
    pub fn source_account(&self) -> Pubkey {
        get_ata(&self.payer.pubkey(), &self.mint)
    }
}

#[async_trait]
impl TransferExecutor for Token2022Executor {
    async fn prepare(&self, transfers: &[PayoutTransfer]) -> Result<SignedPayout, TransferError> {
        let instructions =
            build_payout_instructions(&self.payer.pubkey(), &self.mint, self.decimals, transfers)?;

        let (recent_blockhash, last_valid_block_height) = self
            .rpc
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(|e| TransferError::Rpc(e.to_string()))?;

        let payout = sign_payout(
            &self.payer,
            &instructions,
            recent_blockhash,
            last_valid_block_height,
        );
        debug!(
            signature = %payout.signature,
            recipients = transfers.len(),
            valid_until = last_valid_block_height,
            "Payout signed"
        );
        Ok(payout)
    }

    async fn submit(&self, payout: &SignedPayout) -> Result<(), TransferError> {
        let sig = self
            .rpc
            .send_and_confirm_transaction(&payout.transaction)
            .await
            .map_err(|e| TransferError::Rpc(format!("transaction failed: {}", e)))?;

        info!(signature = %sig, "Payout confirmed");
        Ok(())
    }

    async fn payout_status(
        &self,
        signature: &str,
        last_valid_block_height: u64,
    ) -> Result<PayoutStatus, TransferError> {
        let sig = Signature::from_str(signature)
            .map_err(|_| TransferError::InvalidSignature(signature.to_string()))?;

        let block_height = self
            .rpc
            .get_block_height()
            .await
            .map_err(|e| TransferError::Rpc(e.to_string()))?;

        let statuses = self
            .rpc
            .get_signature_statuses_with_history(&[sig])
            .await
            .map_err(|e| TransferError::Rpc(e.to_string()))?;
        let status = statuses.value.into_iter().next().flatten();

        Ok(classify_status(
            status.as_ref(),
            block_height,
            last_valid_block_height,
        ))
    }
}
