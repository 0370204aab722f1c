//! Published Merkle distributions behind a remote index
//!
//! The index maps each epoch to the URL of its tree file and grows as new
//! epochs are published, so it is only trusted for a few minutes. Tree files
//! are immutable once published and are kept for the life of the process.
//! The per-epoch map is rebuilt only when the index actually changes.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::claims::import_verified_distribution;
use crate::constants;
use crate::http::fetch_json;
use crate::store::{MerkleDistribution, Store};
use crate::ttl_cache::TtlCache;

/// Tree file URL per epoch
pub type TreeUrls = BTreeMap<u64, String>;

pub type DistributionsByEpoch = BTreeMap<u64, Arc<MerkleDistribution>>;

#[async_trait]
pub trait DistributionSource: Send + Sync {
    async fn tree_urls(&self) -> Result<TreeUrls>;

    async fn tree(&self, url: &str) -> Result<MerkleDistribution>;
}

/// Index and tree files served over HTTP
pub struct HttpDistributionSource {
    client: reqwest::Client,
    index_url: String,
}

impl HttpDistributionSource {
    pub fn new(client: reqwest::Client, index_url: &str) -> Self {
        Self {
            client,
            index_url: index_url.to_string(),
        }
    }
}

#[async_trait]
impl DistributionSource for HttpDistributionSource {
    async fn tree_urls(&self) -> Result<TreeUrls> {
        fetch_json(|| self.client.get(&self.index_url))
            .await?
            .ok_or_else(|| anyhow!("distribution index not found at {}", self.index_url))
    }

    async fn tree(&self, url: &str) -> Result<MerkleDistribution> {
        fetch_json(|| self.client.get(url))
            .await?
            .ok_or_else(|| anyhow!("distribution tree not found at {}", url))
    }
}

pub struct CachedDistributions {
    inner: Arc<dyn DistributionSource>,
    index: TtlCache<(), TreeUrls>,
    trees: TtlCache<String, Arc<MerkleDistribution>>,
    by_epoch: Mutex<Option<(TreeUrls, Arc<DistributionsByEpoch>)>>,
}

impl CachedDistributions {
    pub fn new(inner: Arc<dyn DistributionSource>, index_ttl: Duration) -> Self {
        Self {
            inner,
            index: TtlCache::new(Some(index_ttl)),
            trees: TtlCache::immutable(),
            by_epoch: Mutex::new(None),
        }
    }

    async fn tree_urls(&self) -> Result<TreeUrls> {
        if let Some(hit) = self.index.get(&()) {
            return Ok(hit);
        }
        let urls = self.inner.tree_urls().await?;
        debug!(epochs = urls.len(), "fetched distribution index");
        self.index.insert((), urls.clone());
        Ok(urls)
    }

    async fn tree(&self, epoch: u64, url: &str) -> Result<Arc<MerkleDistribution>> {
        let tree = match self.trees.get(&url.to_string()) {
            Some(hit) => hit,
            None => {
                let tree = Arc::new(self.inner.tree(url).await?);
                self.trees.insert(url.to_string(), tree.clone());
                tree
            }
        };
        if tree.root.epoch != epoch {
            bail!(
                "tree at {} is for epoch {}, index lists it for epoch {}",
                url,
                tree.root.epoch,
                epoch
            );
        }
        Ok(tree)
    }

    fn cached_map(&self, urls: &TreeUrls) -> Option<Arc<DistributionsByEpoch>> {
        let guard = self.by_epoch.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some((key, map)) if key == urls => Some(map.clone()),
            _ => None,
        }
    }

    /// Every published distribution keyed by epoch
    pub async fn distributions_by_epoch(&self) -> Result<Arc<DistributionsByEpoch>> {
        let urls = self.tree_urls().await?;
        if let Some(map) = self.cached_map(&urls) {
            return Ok(map);
        }

        let trees: DistributionsByEpoch = stream::iter(urls.iter())
            .map(|(epoch, url)| async move { Ok::<_, anyhow::Error>((*epoch, self.tree(*epoch, url).await?)) })
            .buffer_unordered(constants::DISTRIBUTION_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let map = Arc::new(trees);
        *self.by_epoch.lock().unwrap_or_else(|e| e.into_inner()) = Some((urls, map.clone()));
        Ok(map)
    }

    /// Force the next call to refetch the index
    pub fn invalidate_index(&self) {
        self.index.invalidate(&());
    }
}

/// Import every published epoch not yet in the store
pub async fn sync_distributions(store: &Store, chain_id: u64, remote: &CachedDistributions) -> Result<Vec<u64>> {
    let known = store.distribution_epochs(chain_id).await?;
    let published = remote.distributions_by_epoch().await?;

    let mut imported = Vec::new();
    for (epoch, distribution) in published.iter() {
        if known.contains(epoch) {
            continue;
        }
        import_verified_distribution(store, chain_id, distribution).await?;
        imported.push(*epoch);
    }
    info!(chain_id, published = published.len(), imported = imported.len(), "distributions synced");
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MerkleLeaf, MerkleRoot, RefundStore};
    use crate::testing::addr;
    use alloy::primitives::B256;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tree(epoch: u64, amount: i64) -> MerkleDistribution {
        MerkleDistribution {
            root: MerkleRoot {
                merkle_root: B256::repeat_byte(epoch as u8),
                total_amount: Decimal::from(amount),
                epoch,
            },
            merkle_proofs: vec![MerkleLeaf {
                proof: vec![B256::repeat_byte(0xcc)],
                address: addr(1),
                amount: Decimal::from(amount),
                epoch,
            }],
        }
    }

    #[derive(Default)]
    struct FakeDistributions {
        urls: Mutex<TreeUrls>,
        trees: BTreeMap<String, MerkleDistribution>,
        index_calls: AtomicUsize,
        tree_calls: AtomicUsize,
    }

    impl FakeDistributions {
        fn with_tree(mut self, epoch: u64, amount: i64) -> Self {
            let url = format!("ipfs://tree-{epoch}");
            self.urls.lock().unwrap().insert(epoch, url.clone());
            self.trees.insert(url, tree(epoch, amount));
            self
        }

        fn publish(&self, epoch: u64, url: &str) {
            self.urls.lock().unwrap().insert(epoch, url.to_string());
        }
    }

    #[async_trait]
    impl DistributionSource for FakeDistributions {
        async fn tree_urls(&self) -> Result<TreeUrls> {
            self.index_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.urls.lock().unwrap().clone())
        }

        async fn tree(&self, url: &str) -> Result<MerkleDistribution> {
            self.tree_calls.fetch_add(1, Ordering::SeqCst);
            self.trees.get(url).cloned().ok_or_else(|| anyhow!("no tree at {url}"))
        }
    }

    #[tokio::test]
    async fn test_index_and_trees_are_cached() {
        let fake = Arc::new(FakeDistributions::default().with_tree(10, 100).with_tree(11, 200));
        let cached = CachedDistributions::new(fake.clone(), Duration::from_secs(300));

        let first = cached.distributions_by_epoch().await.unwrap();
        let second = cached.distributions_by_epoch().await.unwrap();

        assert_eq!(first.keys().copied().collect::<Vec<_>>(), vec![10, 11]);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fake.index_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.tree_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_changed_index_only_fetches_new_trees() {
        let mut fake = FakeDistributions::default().with_tree(10, 100);
        fake.trees.insert("ipfs://tree-11".to_string(), tree(11, 200));
        let fake = Arc::new(fake);
        let cached = CachedDistributions::new(fake.clone(), Duration::from_secs(300));

        assert_eq!(cached.distributions_by_epoch().await.unwrap().len(), 1);

        fake.publish(11, "ipfs://tree-11");
        // Still inside the index TTL
        assert_eq!(cached.distributions_by_epoch().await.unwrap().len(), 1);

        cached.invalidate_index();
        let map = cached.distributions_by_epoch().await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&11].root.total_amount, Decimal::from(200));
        assert_eq!(fake.index_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fake.tree_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tree_for_wrong_epoch_is_rejected() {
        let fake = FakeDistributions::default().with_tree(10, 100);
        fake.publish(12, "ipfs://tree-10");
        let cached = CachedDistributions::new(Arc::new(fake), Duration::from_secs(300));

        let err = cached.distributions_by_epoch().await.unwrap_err();
        assert!(err.to_string().contains("index lists it for epoch 12"));
    }

    #[tokio::test]
    async fn test_sync_imports_only_new_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("refunds.sqlite")).await.unwrap();
        let fake = Arc::new(FakeDistributions::default().with_tree(10, 100).with_tree(11, 200));
        let cached = CachedDistributions::new(fake, Duration::from_secs(300));

        assert_eq!(sync_distributions(&store, 1, &cached).await.unwrap(), vec![10, 11]);
        assert!(sync_distributions(&store, 1, &cached).await.unwrap().is_empty());

        let completed = store.completed_refunds(1, addr(1)).await.unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1].amount, Decimal::from(200));
    }
}
