//! Memoizing wrapper around any stake source
//!
//! Snapshots and pool states for hours that have already passed are
//! immutable upstream and are kept for the life of the run. Exact balances
//! are cached with a TTL because a lookup at a recent timestamp can still
//! change while the upstream indexer catches up. Missing data is never
//! cached.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::{BptPoolState, StakePool, StakeSnapshot, StakeSource};
use crate::ttl_cache::TtlCache;

pub struct CachedStakeSource {
    inner: Arc<dyn StakeSource>,
    snapshots: TtlCache<(StakePool, i64), Arc<StakeSnapshot>>,
    balances: TtlCache<(StakePool, Address, i64), Decimal>,
    pool_states: TtlCache<i64, BptPoolState>,
}

impl CachedStakeSource {
    pub fn new(inner: Arc<dyn StakeSource>, balance_ttl: Duration) -> Self {
        Self {
            inner,
            snapshots: TtlCache::immutable(),
            balances: TtlCache::new(Some(balance_ttl)),
            pool_states: TtlCache::immutable(),
        }
    }

    /// Drop everything cached for a pool hour, e.g. after an upstream reindex
    pub fn invalidate_snapshot(&self, pool: StakePool, timestamp: i64) {
        self.snapshots.invalidate(&(pool, timestamp));
    }

    pub fn clear(&self) {
        self.snapshots.clear();
        self.balances.clear();
        self.pool_states.clear();
    }

    pub fn cached_snapshots(&self) -> usize {
        self.snapshots.len()
    }
}

#[async_trait]
impl StakeSource for CachedStakeSource {
    async fn snapshot(&self, pool: StakePool, timestamp: i64) -> Result<Option<Arc<StakeSnapshot>>> {
        let key = (pool, timestamp);
        if let Some(hit) = self.snapshots.get(&key) {
            return Ok(Some(hit));
        }
        let fetched = self.inner.snapshot(pool, timestamp).await?;
        if let Some(snapshot) = &fetched {
            self.snapshots.insert(key, Arc::clone(snapshot));
        }
        Ok(fetched)
    }

    async fn balance(&self, pool: StakePool, address: Address, timestamp: i64) -> Result<Option<Decimal>> {
        let key = (pool, address, timestamp);
        if let Some(hit) = self.balances.get(&key) {
            return Ok(Some(hit));
        }
        let fetched = self.inner.balance(pool, address, timestamp).await?;
        if let Some(balance) = fetched {
            self.balances.insert(key, balance);
        }
        Ok(fetched)
    }

    async fn bpt_pool_state(&self, timestamp: i64) -> Result<Option<BptPoolState>> {
        if let Some(hit) = self.pool_states.get(&timestamp) {
            return Ok(Some(hit));
        }
        let fetched = self.inner.bpt_pool_state(timestamp).await?;
        if let Some(state) = fetched {
            self.pool_states.insert(timestamp, state);
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, FakeStakeSource};
    use crate::types::whole_tokens;

    #[tokio::test]
    async fn test_snapshots_fetched_once() {
        let fake = Arc::new(
            FakeStakeSource::default().with_balance(StakePool::Staking, addr(1), 0, whole_tokens(5)),
        );
        let cached = CachedStakeSource::new(fake.clone(), Duration::from_secs(60));

        let first = cached.snapshot(StakePool::Staking, 3_600).await.unwrap().unwrap();
        let second = cached.snapshot(StakePool::Staking, 3_600).await.unwrap().unwrap();

        assert_eq!(first.get(&addr(1)), Some(&whole_tokens(5)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fake.calls(), 1);
        assert_eq!(cached.cached_snapshots(), 1);
    }

    #[tokio::test]
    async fn test_missing_data_is_not_cached() {
        let fake = Arc::new(FakeStakeSource::default().with_missing(StakePool::Staking, 7_200));
        let cached = CachedStakeSource::new(fake.clone(), Duration::from_secs(60));

        assert!(cached.snapshot(StakePool::Staking, 7_200).await.unwrap().is_none());
        assert!(cached.snapshot(StakePool::Staking, 7_200).await.unwrap().is_none());
        assert_eq!(fake.calls(), 2);
        assert_eq!(cached.cached_snapshots(), 0);
    }

    #[tokio::test]
    async fn test_expired_balances_are_refetched() {
        let fake = Arc::new(
            FakeStakeSource::default().with_balance(StakePool::Staking, addr(2), 0, whole_tokens(1)),
        );
        let cached = CachedStakeSource::new(fake.clone(), Duration::ZERO);

        cached.balance(StakePool::Staking, addr(2), 100).await.unwrap();
        cached.balance(StakePool::Staking, addr(2), 100).await.unwrap();
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_snapshot_forces_refetch() {
        let fake = Arc::new(FakeStakeSource::default());
        let cached = CachedStakeSource::new(fake.clone(), Duration::from_secs(60));

        cached.snapshot(StakePool::SafetyModule, 0).await.unwrap();
        cached.invalidate_snapshot(StakePool::SafetyModule, 0);
        cached.snapshot(StakePool::SafetyModule, 0).await.unwrap();
        assert_eq!(fake.calls(), 2);
    }
}
