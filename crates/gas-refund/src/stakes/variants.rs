//! One function per stake algorithm, built from per-pool components
//!
//! The safety module components `safety_module_unlocked` and
//! `safety_module_partial_bpt` reproduce the arithmetic used when their
//! epochs were distributed: the first ignores the lockup, the second values
//! BPT by the token reserve only. Do not correct them; closed epochs are
//! replayed with these exact formulas.

use alloy::primitives::Address;
use anyhow::Result;
use rust_decimal::Decimal;
use tracing::debug;

use super::{BptPoolState, MissingStakePolicy, ResolverSettings, StakePool, StakeSource};
use crate::epochs::StakeAlgorithm;
use crate::error::RefundError;
use crate::time::{hours_between, start_of_day};

/// Inputs shared by every variant
pub struct StakeLookup<'a> {
    pub source: &'a dyn StakeSource,
    pub address: Address,
    pub timestamp: i64,
    pub settings: &'a ResolverSettings,
}

impl StakeLookup<'_> {
    fn or_missing(&self, value: Option<Decimal>, pool: StakePool, at: i64) -> Result<Decimal> {
        match (value, self.settings.missing_policy) {
            (Some(value), _) => Ok(value),
            (None, MissingStakePolicy::Zero) => {
                debug!(%pool, at, address = %self.address, "missing stake data, counting as zero");
                Ok(Decimal::ZERO)
            }
            (None, MissingStakePolicy::Abort) => {
                Err(RefundError::MissingStakeData { pool, timestamp: at }.into())
            }
        }
    }

    async fn exact(&self, pool: StakePool, at: i64) -> Result<Decimal> {
        let value = self.source.balance(pool, self.address, at).await?;
        self.or_missing(value, pool, at)
    }

    async fn from_snapshot(&self, pool: StakePool, hour: i64) -> Result<Decimal> {
        let snapshot = self.source.snapshot(pool, hour).await?;
        let value = snapshot.map(|s| s.get(&self.address).copied().unwrap_or(Decimal::ZERO));
        self.or_missing(value, pool, hour)
    }

    /// Highest balance over `[t - lockup, t]`: a decrease only counts once it
    /// has held for a whole lockup window.
    async fn with_virtual_lockup(&self, pool: StakePool) -> Result<Decimal> {
        let mut eligible = self.exact(pool, self.timestamp).await?;
        let from = self.timestamp - self.settings.virtual_lockup_secs;
        for hour in hours_between(from, self.timestamp) {
            eligible = eligible.max(self.from_snapshot(pool, hour).await?);
        }
        Ok(eligible)
    }

    async fn pool_state(&self) -> Result<Option<BptPoolState>> {
        let state = self.source.bpt_pool_state(self.timestamp).await?;
        if state.is_none() && self.settings.missing_policy == MissingStakePolicy::Abort {
            return Err(RefundError::MissingStakeData {
                pool: StakePool::SafetyModule,
                timestamp: self.timestamp,
            }
            .into());
        }
        Ok(state)
    }
}

fn bpt_share(bpt: Decimal, state: &BptPoolState) -> Decimal {
    if state.bpt_total_supply.is_zero() {
        return Decimal::ZERO;
    }
    bpt / state.bpt_total_supply
}

// =============================================================================
// Pool Components
// =============================================================================

/// Staking pool balance at 00:00 UTC of the transaction's day
pub async fn staking_same_day(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    lookup
        .from_snapshot(StakePool::Staking, start_of_day(lookup.timestamp))
        .await
}

pub async fn staking_exact(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    lookup.exact(StakePool::Staking, lookup.timestamp).await
}

pub async fn staking_virtual_lockup(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    lookup.with_virtual_lockup(StakePool::Staking).await
}

/// Historical: exact BPT balance, token side of the pool only
pub async fn safety_module_unlocked(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    let bpt = lookup.exact(StakePool::SafetyModule, lookup.timestamp).await?;
    let Some(state) = lookup.pool_state().await? else {
        return Ok(Decimal::ZERO);
    };
    Ok(bpt_share(bpt, &state) * state.token_reserve)
}

/// Historical: BPT under lockup, token side of the pool only
pub async fn safety_module_partial_bpt(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    let bpt = lookup.with_virtual_lockup(StakePool::SafetyModule).await?;
    let Some(state) = lookup.pool_state().await? else {
        return Ok(Decimal::ZERO);
    };
    Ok(bpt_share(bpt, &state) * state.token_reserve)
}

/// BPT under lockup, valued as the whole pool expressed in the protocol token
pub async fn safety_module_locked(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    let bpt = lookup.with_virtual_lockup(StakePool::SafetyModule).await?;
    let Some(state) = lookup.pool_state().await? else {
        return Ok(Decimal::ZERO);
    };
    if state.token_weight <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    Ok(bpt_share(bpt, &state) * (state.token_reserve / state.token_weight))
}

pub async fn unified(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    let pool = StakePool::Unified {
        chain_id: lookup.settings.unified_chain_id,
    };
    lookup.exact(pool, lookup.timestamp).await
}

// =============================================================================
// Algorithms
// =============================================================================

pub async fn legacy_same_day(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    staking_same_day(lookup).await
}

pub async fn exact_timestamp(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    staking_exact(lookup).await
}

pub async fn exact_with_unlocked_safety_module(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    Ok(staking_exact(lookup).await? + safety_module_unlocked(lookup).await?)
}

pub async fn virtual_lockup_partial_bpt(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    Ok(staking_virtual_lockup(lookup).await? + safety_module_partial_bpt(lookup).await?)
}

pub async fn virtual_lockup(lookup: &StakeLookup<'_>) -> Result<Decimal> {
    Ok(staking_virtual_lockup(lookup).await? + safety_module_locked(lookup).await?)
}

pub async fn resolve_with(algorithm: StakeAlgorithm, lookup: &StakeLookup<'_>) -> Result<Decimal> {
    match algorithm {
        StakeAlgorithm::LegacySameDay => legacy_same_day(lookup).await,
        StakeAlgorithm::ExactTimestamp => exact_timestamp(lookup).await,
        StakeAlgorithm::SafetyModuleUnlocked => exact_with_unlocked_safety_module(lookup).await,
        StakeAlgorithm::VirtualLockupPartialBpt => virtual_lockup_partial_bpt(lookup).await,
        StakeAlgorithm::VirtualLockup => virtual_lockup(lookup).await,
        StakeAlgorithm::Unified => unified(lookup).await,
    }
}

pub async fn safety_module_component(
    algorithm: StakeAlgorithm,
    lookup: &StakeLookup<'_>,
) -> Result<Decimal> {
    match algorithm {
        StakeAlgorithm::SafetyModuleUnlocked => safety_module_unlocked(lookup).await,
        StakeAlgorithm::VirtualLockupPartialBpt => safety_module_partial_bpt(lookup).await,
        StakeAlgorithm::VirtualLockup => safety_module_locked(lookup).await,
        StakeAlgorithm::LegacySameDay | StakeAlgorithm::ExactTimestamp | StakeAlgorithm::Unified => {
            Ok(Decimal::ZERO)
        }
    }
}
