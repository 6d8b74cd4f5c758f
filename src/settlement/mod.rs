//! Settlement Module
//!
//! Pays depositors in Token-2022 tokens.
//!
//! # Components:
//! - `batcher`: periodic claim, grouping and status bookkeeping
//! - `executor`: multi-recipient Token-2022 transfer transactions

pub mod batcher;
pub mod executor;

pub use batcher::{BatcherConfig, SettlementBatcher, SettlementRunReport};
pub use executor::{
    PayoutStatus, PayoutTransfer, SignedPayout, Token2022Executor, TransferError, TransferExecutor,
};
