//! Claimable refunds of an address against published Merkle distributions

use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ChainConfig;
use crate::error::RefundError;
use crate::store::{MerkleDistribution, MerkleRoot, RefundStore, Store};
use crate::types::{round_base_units, ClaimEntry, ClaimsResponse, RefundRecord};

sol! {
    #[sol(rpc)]
    interface IMerkleRedeem {
        function seedAllocations(uint256 _week, bytes32 _merkleRoot, uint256 _totalAllocation);
        function claimStatus(address _liquidityProvider, uint256 _begin, uint256 _end) external view returns (bool[] memory);
    }
}

/// Claimed flag per epoch of `[start_epoch, end_epoch]`, index-aligned
#[async_trait]
pub trait ClaimStatusReader: Send + Sync {
    async fn claim_status(&self, address: Address, start_epoch: u64, end_epoch: u64) -> Result<Vec<bool>>;
}

/// Reads claim status from the chain's MerkleRedeem contract
pub struct OnChainClaimStatus {
    provider: DynProvider,
    merkle_redeem: Address,
}

impl OnChainClaimStatus {
    pub fn new(chain: &ChainConfig) -> Result<Self> {
        let rpc_url = chain
            .rpc_url
            .parse()
            .with_context(|| format!("Invalid rpc_url for chain {}", chain.chain_id))?;
        Ok(Self {
            provider: ProviderBuilder::new().connect_http(rpc_url).erased(),
            merkle_redeem: chain.merkle_redeem,
        })
    }
}

#[async_trait]
impl ClaimStatusReader for OnChainClaimStatus {
    async fn claim_status(&self, address: Address, start_epoch: u64, end_epoch: u64) -> Result<Vec<bool>> {
        let contract = IMerkleRedeem::new(self.merkle_redeem, &self.provider);
        let status = contract
            .claimStatus(address, U256::from(start_epoch), U256::from(end_epoch))
            .call()
            .await
            .with_context(|| format!("claimStatus call failed for {}", address))?;
        Ok(status)
    }
}

pub struct MerkleClaimResolver {
    store: Arc<dyn RefundStore>,
    reader: Arc<dyn ClaimStatusReader>,
    chain_id: u64,
    genesis_epoch: u64,
}

impl MerkleClaimResolver {
    pub fn new(
        store: Arc<dyn RefundStore>,
        reader: Arc<dyn ClaimStatusReader>,
        chain_id: u64,
        genesis_epoch: u64,
    ) -> Self {
        Self {
            store,
            reader,
            chain_id,
            genesis_epoch,
        }
    }

    /// Completed refunds not yet claimed on-chain, plus the pending amount of the running epoch
    pub async fn claims_for_address(&self, address: Address, current_epoch: u64) -> Result<ClaimsResponse> {
        let last_closed = current_epoch.saturating_sub(1);
        let start_epoch = self.genesis_epoch;
        let end_epoch = last_closed.max(self.genesis_epoch);

        let (completed, status, pending) = tokio::try_join!(
            self.store.completed_refunds(self.chain_id, address),
            self.reader.claim_status(address, start_epoch, end_epoch),
            self.store
                .pending_refunded_amounts(self.chain_id, current_epoch, address),
        )?;

        let expected = (end_epoch - start_epoch + 1) as usize;
        if status.len() != expected {
            return Err(RefundError::ClaimStatusLengthMismatch {
                expected,
                actual: status.len(),
            }
            .into());
        }
        let claimed: HashMap<u64, bool> = (start_epoch..=end_epoch).zip(status).collect();

        let mut total = Decimal::ZERO;
        let mut claims = Vec::new();
        for refund in completed {
            if claimed.get(&refund.epoch).copied().unwrap_or(false) {
                debug!(%address, epoch = refund.epoch, "already claimed");
                continue;
            }
            total += refund.amount;
            claims.push(ClaimEntry {
                epoch: refund.epoch,
                address: refund.address,
                proof: refund.merkle_proof,
                amount: base_unit_string(refund.amount),
            });
        }

        let pending: Decimal = pending.into_iter().sum();
        Ok(ClaimsResponse {
            total_claimable: base_unit_string(total),
            claims,
            pending_claimable: base_unit_string(pending),
        })
    }

    /// Every aggregate of an epoch on this chain, completed or not
    pub async fn epoch_entries(&self, epoch: u64) -> Result<Vec<RefundRecord>> {
        self.store.epoch_records(self.chain_id, epoch).await
    }
}

fn base_unit_string(amount: Decimal) -> String {
    round_base_units(amount).to_string()
}

/// Unsigned `seedAllocations` transaction publishing a distribution root on-chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedAllocationTx {
    pub to: Address,
    pub chain_id: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochSeedData {
    pub root: MerkleRoot,
    pub tx_params: SeedAllocationTx,
}

/// ABI-encoded `seedAllocations(epoch, merkleRoot, totalAmount)`
pub fn seed_allocations_calldata(root: &MerkleRoot) -> Result<Bytes> {
    let total = round_base_units(root.total_amount);
    if total.is_sign_negative() {
        bail!("distribution total {} of epoch {} is negative", total, root.epoch);
    }
    let total_allocation: U256 = total
        .to_string()
        .parse()
        .with_context(|| format!("distribution total {} does not fit uint256", total))?;

    let call = IMerkleRedeem::seedAllocationsCall {
        _week: U256::from(root.epoch),
        _merkleRoot: root.merkle_root,
        _totalAllocation: total_allocation,
    };
    Ok(call.abi_encode().into())
}

/// Seed transaction for an imported epoch, `None` when the epoch has no distribution yet
pub async fn seed_allocations_for_epoch(store: &Store, chain: &ChainConfig, epoch: u64) -> Result<Option<EpochSeedData>> {
    let Some(root) = store.distribution_root(chain.chain_id, epoch).await? else {
        return Ok(None);
    };
    let data = seed_allocations_calldata(&root)?;
    Ok(Some(EpochSeedData {
        root,
        tx_params: SeedAllocationTx {
            to: chain.merkle_redeem,
            chain_id: chain.chain_id,
            data,
        },
    }))
}

/// Read a distribution file and mark its leaves completed
pub async fn import_distribution_file(store: &Store, chain_id: u64, path: &Path) -> Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let distribution: MerkleDistribution = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse distribution {}", path.display()))?;

    import_verified_distribution(store, chain_id, &distribution).await
}

/// Check that the leaves add up to the root total, then store the distribution
pub async fn import_verified_distribution(
    store: &Store,
    chain_id: u64,
    distribution: &MerkleDistribution,
) -> Result<usize> {
    let leaves_total: Decimal = distribution.merkle_proofs.iter().map(|leaf| leaf.amount).sum();
    if leaves_total != distribution.root.total_amount {
        bail!(
            "distribution total {} does not match the sum of its leaves {}",
            distribution.root.total_amount,
            leaves_total
        );
    }

    let imported = store.import_distribution(chain_id, distribution).await?;
    info!(
        chain_id,
        epoch = distribution.root.epoch,
        root = %distribution.root.merkle_root,
        imported,
        "imported merkle distribution"
    );
    Ok(imported)
}
