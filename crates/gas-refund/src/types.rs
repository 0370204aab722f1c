//! Shared data types: fetched transactions, refund rows, aggregates and claims

use alloy::primitives::{Address, B256};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::constants;

/// One whole token (or chain currency unit) in base units
pub fn one_token() -> Decimal {
    Decimal::from(10u64.pow(constants::TOKEN_DECIMALS))
}

/// Convert a whole-token amount to base units
pub fn whole_tokens(amount: u64) -> Decimal {
    Decimal::from(amount) * one_token()
}

/// Round a base-unit amount to an integer (half away from zero)
pub fn round_base_units(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

// =============================================================================
// Fetched Data
// =============================================================================

/// Transaction against a monitored contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundableTransaction {
    pub hash: B256,
    pub block_number: u64,
    pub timestamp: i64,
    pub tx_origin: Address,
    pub gas_used: u64,
    pub gas_price: u64,
    pub contract: String,
}

/// Successful swap; gas used is resolved separately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTransaction {
    pub hash: B256,
    pub block_number: u64,
    pub timestamp: i64,
    pub tx_origin: Address,
    pub gas_price: u64,
}

/// Same-day prices for a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRate {
    pub token_usd: Decimal,
    pub chain_currency_usd: Decimal,
    /// Price of one token expressed in chain currency
    pub token_per_chain_currency: Decimal,
}

impl PriceRate {
    pub fn from_usd_prices(token_usd: Decimal, chain_currency_usd: Decimal) -> Option<Self> {
        if token_usd <= Decimal::ZERO || chain_currency_usd <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            token_usd,
            chain_currency_usd,
            token_per_chain_currency: token_usd / chain_currency_usd,
        })
    }
}

// =============================================================================
// Fee Arithmetic
// =============================================================================

/// Gas cost of one transaction in every denomination the program tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasCost {
    /// Gas used times gas price, in chain currency base units (wei)
    pub chain_currency: Decimal,
    pub usd: Decimal,
    /// Fee converted to token base units
    pub token: Decimal,
}

impl GasCost {
    pub fn compute(gas_used: u64, gas_price: u64, rate: &PriceRate) -> Self {
        let chain_currency = Decimal::from(gas_used) * Decimal::from(gas_price);
        Self {
            chain_currency,
            usd: chain_currency * rate.chain_currency_usd / one_token(),
            token: chain_currency * rate.chain_currency_usd / rate.token_usd,
        }
    }

    /// Refund for a percent, returned as (token base units, USD)
    pub fn refund(&self, percent: Decimal) -> (Decimal, Decimal) {
        (self.token * percent, self.usd * percent)
    }
}

// =============================================================================
// Persisted Rows
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Idle,
    Validated,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "validated" => Self::Validated,
            "rejected" => Self::Rejected,
            _ => Self::Idle,
        }
    }
}

/// One qualifying transaction written by the windowed indexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTransaction {
    pub epoch: u64,
    pub address: Address,
    pub chain_id: u64,
    pub hash: B256,
    pub block_number: u64,
    pub timestamp: i64,
    pub gas_used: u64,
    pub gas_price: u64,
    pub gas_used_chain_currency: Decimal,
    pub token_usd: Decimal,
    pub chain_currency_usd: Decimal,
    pub token_per_chain_currency: Decimal,
    pub gas_used_usd: Decimal,
    pub total_stake_amount: Decimal,
    pub refunded_amount_token: Decimal,
    pub refunded_amount_usd: Decimal,
    pub contract: String,
    pub status: TransactionStatus,
}

/// Per-address, per-epoch, per-chain refund aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRecord {
    pub epoch: u64,
    pub address: Address,
    pub chain_id: u64,
    pub accumulated_gas_used: Decimal,
    pub accumulated_gas_used_chain_currency: Decimal,
    pub accumulated_gas_used_usd: Decimal,
    pub accumulated_gas_used_token: Decimal,
    pub total_stake_amount: Decimal,
    pub refunded_amount_token: Decimal,
    pub refunded_amount_usd: Decimal,
    pub first_block: u64,
    pub last_block: u64,
    pub first_tx: B256,
    pub last_tx: B256,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub transaction_count: u64,
    pub is_completed: bool,
    /// Set by the epoch-closing process together with `is_completed`
    pub merkle_proof: Vec<B256>,
}

// =============================================================================
// Claims
// =============================================================================

/// A completed refund for one epoch, as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRefund {
    pub epoch: u64,
    pub address: Address,
    pub amount: Decimal,
    pub merkle_proof: Vec<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEntry {
    pub epoch: u64,
    pub address: Address,
    pub proof: Vec<B256>,
    /// Token base units as an integer string
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsResponse {
    pub total_claimable: String,
    pub claims: Vec<ClaimEntry>,
    pub pending_claimable: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_whole_tokens() {
        assert_eq!(whole_tokens(1), dec("1000000000000000000"));
        assert_eq!(whole_tokens(50_000), dec("50000000000000000000000"));
    }

    #[test]
    fn test_round_base_units() {
        assert_eq!(round_base_units(dec("49.5")), dec("50"));
        assert_eq!(round_base_units(dec("49.49")), dec("49"));
    }

    #[test]
    fn test_fee_and_half_refund() {
        // 100 wei of gas, one token is worth one chain currency unit
        let rate = PriceRate {
            token_usd: dec("2"),
            chain_currency_usd: dec("2"),
            token_per_chain_currency: dec("1"),
        };
        let cost = GasCost::compute(100, 1, &rate);
        assert_eq!(cost.chain_currency, dec("100"));
        assert_eq!(cost.token, dec("100"));
        assert_eq!(cost.usd, dec("100") * dec("2") / one_token());

        let (token, usd) = cost.refund(dec("0.5"));
        assert_eq!(token, dec("50"));
        // 50 base units at $2 per whole token
        assert_eq!(usd, dec("0.0000000000000001"));
    }

    #[test]
    fn test_fee_in_tokens_uses_cross_rate() {
        let rate = PriceRate::from_usd_prices(dec("0.05"), dec("2000")).unwrap();
        assert_eq!(rate.token_per_chain_currency, dec("0.000025"));

        // 200k gas at 20 gwei = 0.004 ETH = $8 = 160 tokens
        let cost = GasCost::compute(200_000, 20_000_000_000, &rate);
        assert_eq!(cost.chain_currency, dec("4000000000000000"));
        assert_eq!(cost.usd, dec("8"));
        assert_eq!(cost.token, whole_tokens(160));

        let (token, usd) = cost.refund(dec("0.75"));
        assert_eq!(token, whole_tokens(120));
        assert_eq!(usd, dec("6"));
    }

    #[test]
    fn test_refund_usd_is_exact_with_fractional_token_price() {
        let rate = PriceRate::from_usd_prices(dec("0.07"), dec("2000")).unwrap();
        let cost = GasCost::compute(200_000, 20_000_000_000, &rate);
        assert_eq!(cost.usd, dec("8"));
        // 8 USD at $0.07 per token
        assert_eq!(round_base_units(cost.token), dec("114285714285714285714"));

        let (token, usd) = cost.refund(dec("0.75"));
        assert_eq!(usd, dec("6"));
        assert_eq!(usd + usd, dec("12"));
        assert_eq!(round_base_units(token), dec("85714285714285714286"));
    }

    #[test]
    fn test_rate_requires_positive_prices() {
        assert!(PriceRate::from_usd_prices(Decimal::ZERO, dec("1")).is_none());
        assert!(PriceRate::from_usd_prices(dec("1"), Decimal::ZERO).is_none());
    }

    #[test]
    fn test_claims_response_shape() {
        let response = ClaimsResponse {
            total_claimable: "10".to_string(),
            claims: vec![],
            pending_claimable: "0".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["totalClaimable"], "10");
        assert_eq!(json["pendingClaimable"], "0");
        assert!(json["claims"].as_array().unwrap().is_empty());
    }
}
