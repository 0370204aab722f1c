//! Fatal integrity errors
//!
//! These abort the current window or run. They travel inside `anyhow::Error`
//! and callers recover them with `downcast_ref::<RefundError>()`.

use alloy::primitives::Address;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::stakes::StakePool;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefundError {
    #[error("claim status length mismatch: expected {expected} epochs, got {actual}")]
    ClaimStatusLengthMismatch { expected: usize, actual: usize },

    #[error("clipped increment for {address} is negative ({remaining_usd} USD left): account was refunded over its cap")]
    NegativeClippedIncrement { address: Address, remaining_usd: Decimal },

    #[error("no price rate available for timestamp {timestamp}")]
    MissingPriceRate { timestamp: i64 },

    #[error("no refund percent found for {address} in epoch {epoch}")]
    MissingRefundPercent { address: Address, epoch: u64 },

    #[error("missing {pool} stake data at {timestamp}")]
    MissingStakeData { pool: StakePool, timestamp: i64 },

    #[error("epoch {epoch} precedes every configured threshold")]
    UnknownEpoch { epoch: u64 },
}
