//! Epoch-versioned stake resolution
//!
//! The eligible stake of an address at a timestamp depends on which staking
//! algorithm was in force for the epoch being computed. Closed epochs must
//! stay reproducible, so every historical algorithm (including the ones with
//! known arithmetic flaws) is kept as its own function in [`variants`] and
//! selected through the epoch table only.

pub mod cached;
pub mod http;
pub mod variants;

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::epochs::{EpochTable, StakeAlgorithm};
use crate::error::RefundError;

/// Pools a stake can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StakePool {
    /// First single staking pool (token-denominated)
    Staking,
    /// Second pool holding BPT (weighted pool token of the protocol token)
    SafetyModule,
    /// Post-migration consolidated stakes for one chain
    Unified { chain_id: u64 },
}

impl std::fmt::Display for StakePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staking => f.write_str("staking"),
            Self::SafetyModule => f.write_str("safety_module"),
            Self::Unified { chain_id } => write!(f, "unified:{}", chain_id),
        }
    }
}

/// Address -> balance at one hour-aligned timestamp
pub type StakeSnapshot = HashMap<Address, Decimal>;

/// Weighted pool backing the safety module's BPT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BptPoolState {
    pub bpt_total_supply: Decimal,
    /// Protocol token held by the pool, base units
    pub token_reserve: Decimal,
    /// Share of pool value held in the protocol token, e.g. 0.8
    pub token_weight: Decimal,
}

/// Upstream stake data. `None` means the data is missing, not that the balance is zero.
#[async_trait]
pub trait StakeSource: Send + Sync {
    async fn snapshot(&self, pool: StakePool, timestamp: i64) -> Result<Option<Arc<StakeSnapshot>>>;

    async fn balance(
        &self,
        pool: StakePool,
        address: Address,
        timestamp: i64,
    ) -> Result<Option<Decimal>>;

    async fn bpt_pool_state(&self, timestamp: i64) -> Result<Option<BptPoolState>>;
}

/// What to do when historical stake data is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingStakePolicy {
    /// Count the missing balance as zero and keep going
    #[default]
    Zero,
    /// Fail with `RefundError::MissingStakeData`
    Abort,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub virtual_lockup_secs: i64,
    pub unified_chain_id: u64,
    pub missing_policy: MissingStakePolicy,
}

/// Resolves eligible stake for (address, timestamp, epoch)
pub struct VersionedStakeResolver {
    source: Arc<dyn StakeSource>,
    algorithms: EpochTable<StakeAlgorithm>,
    settings: ResolverSettings,
}

impl VersionedStakeResolver {
    pub fn new(
        source: Arc<dyn StakeSource>,
        algorithms: EpochTable<StakeAlgorithm>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            source,
            algorithms,
            settings,
        }
    }

    pub fn algorithm(&self, epoch: u64) -> Result<StakeAlgorithm, RefundError> {
        self.algorithms
            .lookup(epoch)
            .copied()
            .ok_or(RefundError::UnknownEpoch { epoch })
    }

    fn lookup(&self, address: Address, timestamp: i64) -> variants::StakeLookup<'_> {
        variants::StakeLookup {
            source: self.source.as_ref(),
            address,
            timestamp,
            settings: &self.settings,
        }
    }

    /// Eligible stake in token base units
    pub async fn resolve(&self, address: Address, timestamp: i64, epoch: u64) -> Result<Decimal> {
        let algorithm = self.algorithm(epoch)?;
        variants::resolve_with(algorithm, &self.lookup(address, timestamp)).await
    }

    /// Safety module part of the epoch's algorithm alone (zero when the epoch has none)
    pub async fn safety_module_stake(
        &self,
        address: Address,
        timestamp: i64,
        epoch: u64,
    ) -> Result<Decimal> {
        let algorithm = self.algorithm(epoch)?;
        variants::safety_module_component(algorithm, &self.lookup(address, timestamp)).await
    }

    pub fn source(&self) -> &Arc<dyn StakeSource> {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epochs::EpochRules;
    use crate::testing::{addr, FakeStakeSource};
    use crate::types::whole_tokens;

    fn resolver(source: FakeStakeSource) -> VersionedStakeResolver {
        VersionedStakeResolver::new(
            Arc::new(source),
            EpochRules::default().algorithms,
            ResolverSettings {
                virtual_lockup_secs: 7 * 86_400,
                unified_chain_id: 1,
                missing_policy: MissingStakePolicy::Zero,
            },
        )
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let a = addr(1);
        let t = 1_700_000_000;
        let source = FakeStakeSource::default()
            .with_balance(StakePool::Staking, a, t - 3_600, whole_tokens(1_000))
            .with_balance(StakePool::Staking, a, t, whole_tokens(800));
        let resolver = resolver(source);

        for epoch in [9, 11, 12, 14, 20, 32] {
            let first = resolver.resolve(a, t, epoch).await.unwrap();
            let second = resolver.resolve(a, t, epoch).await.unwrap();
            assert_eq!(first, second, "epoch {}", epoch);
        }
    }

    #[tokio::test]
    async fn test_dispatch_switches_algorithm_by_epoch() {
        let a = addr(2);
        let t = 1_700_000_000;
        let source = FakeStakeSource::default()
            .with_balance(StakePool::Staking, a, t, whole_tokens(700))
            .with_balance(StakePool::Unified { chain_id: 1 }, a, t, whole_tokens(9_000));
        let resolver = resolver(source);

        assert_eq!(resolver.resolve(a, t, 11).await.unwrap(), whole_tokens(700));
        assert_eq!(resolver.resolve(a, t, 32).await.unwrap(), whole_tokens(9_000));
        assert_eq!(resolver.resolve(a, t, 40).await.unwrap(), whole_tokens(9_000));
    }

    #[tokio::test]
    async fn test_epoch_before_genesis_is_an_error() {
        let resolver = resolver(FakeStakeSource::default());
        let err = resolver.resolve(addr(1), 0, 2).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<RefundError>(),
            Some(&RefundError::UnknownEpoch { epoch: 2 })
        );
    }

    #[tokio::test]
    async fn test_safety_module_component_only_when_active() {
        let a = addr(3);
        let t = 1_700_000_000;
        let source = FakeStakeSource::default()
            .with_balance(StakePool::SafetyModule, a, t, whole_tokens(10))
            .with_pool_state(
                t,
                BptPoolState {
                    bpt_total_supply: whole_tokens(100),
                    token_reserve: whole_tokens(1_000),
                    token_weight: "0.8".parse().unwrap(),
                },
            );
        let resolver = resolver(source);

        assert_eq!(resolver.safety_module_stake(a, t, 11).await.unwrap(), Decimal::ZERO);
        assert_eq!(
            resolver.safety_module_stake(a, t, 12).await.unwrap(),
            whole_tokens(100)
        );
        assert_eq!(resolver.safety_module_stake(a, t, 32).await.unwrap(), Decimal::ZERO);
    }
}
