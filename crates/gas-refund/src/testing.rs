//! In-memory collaborators for tests

use alloy::primitives::{Address, B256};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::claims::ClaimStatusReader;
use crate::prices::PriceResolver;
use crate::sources::{SwapSource, TransactionSource};
use crate::stakes::{BptPoolState, StakePool, StakeSnapshot, StakeSource};
use crate::store::RefundStore;
use crate::types::{
    round_base_units, CompletedRefund, PriceRate, RefundRecord, RefundTransaction, RefundableTransaction,
    SwapTransaction,
};

pub fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

pub fn tx_hash(n: u64) -> B256 {
    B256::left_padding_from(&n.to_be_bytes())
}

// =============================================================================
// Stakes
// =============================================================================

/// Balance histories; a balance holds from its timestamp until the next change
#[derive(Default)]
pub struct FakeStakeSource {
    history: HashMap<StakePool, HashMap<Address, BTreeMap<i64, Decimal>>>,
    pool_states: BTreeMap<i64, BptPoolState>,
    missing: HashSet<(StakePool, i64)>,
    calls: AtomicUsize,
}

impl FakeStakeSource {
    pub fn with_balance(mut self, pool: StakePool, address: Address, from: i64, amount: Decimal) -> Self {
        self.history
            .entry(pool)
            .or_default()
            .entry(address)
            .or_default()
            .insert(from, amount);
        self
    }

    pub fn with_pool_state(mut self, from: i64, state: BptPoolState) -> Self {
        self.pool_states.insert(from, state);
        self
    }

    /// Make both the snapshot and exact lookups at this timestamp report missing data
    pub fn with_missing(mut self, pool: StakePool, timestamp: i64) -> Self {
        self.missing.insert((pool, timestamp));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn balance_at(&self, pool: StakePool, address: &Address, at: i64) -> Decimal {
        self.history
            .get(&pool)
            .and_then(|by_address| by_address.get(address))
            .and_then(|changes| changes.range(..=at).next_back())
            .map(|(_, amount)| *amount)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl StakeSource for FakeStakeSource {
    async fn snapshot(&self, pool: StakePool, timestamp: i64) -> Result<Option<Arc<StakeSnapshot>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&(pool, timestamp)) {
            return Ok(None);
        }
        let snapshot = self
            .history
            .get(&pool)
            .map(|by_address| {
                by_address
                    .keys()
                    .map(|address| (*address, self.balance_at(pool, address, timestamp)))
                    .filter(|(_, amount)| !amount.is_zero())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(Arc::new(snapshot)))
    }

    async fn balance(&self, pool: StakePool, address: Address, timestamp: i64) -> Result<Option<Decimal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&(pool, timestamp)) {
            return Ok(None);
        }
        Ok(Some(self.balance_at(pool, &address, timestamp)))
    }

    async fn bpt_pool_state(&self, timestamp: i64) -> Result<Option<BptPoolState>> {
        Ok(self
            .pool_states
            .range(..=timestamp)
            .next_back()
            .map(|(_, state)| *state))
    }
}

// =============================================================================
// Transactions and Swaps
// =============================================================================

#[derive(Default)]
pub struct FakeTransactionSource {
    by_contract: HashMap<String, Vec<RefundableTransaction>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransactionSource {
    pub fn with_transaction(mut self, tx: RefundableTransaction) -> Self {
        self.by_contract.entry(tx.contract.clone()).or_default().push(tx);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionSource for FakeTransactionSource {
    async fn transactions(
        &self,
        _chain_id: u64,
        contract: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RefundableTransaction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        // Let other contracts' fetches start if the caller allows it
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self
            .by_contract
            .get(contract)
            .map(|txs| {
                txs.iter()
                    .filter(|tx| tx.timestamp >= start && tx.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeSwapSource {
    swaps: Vec<SwapTransaction>,
    gas_used: HashMap<B256, u64>,
    calls: AtomicUsize,
}

impl FakeSwapSource {
    pub fn with_swap(mut self, swap: SwapTransaction, gas_used: u64) -> Self {
        self.gas_used.insert(swap.hash, gas_used);
        self.swaps.push(swap);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwapSource for FakeSwapSource {
    async fn successful_swaps(&self, _chain_id: u64, start: i64, end: i64) -> Result<Vec<SwapTransaction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .swaps
            .iter()
            .filter(|swap| swap.timestamp >= start && swap.timestamp < end)
            .cloned()
            .collect())
    }

    async fn gas_used(&self, _chain_id: u64, hash: B256) -> Result<u64> {
        match self.gas_used.get(&hash) {
            Some(gas) => Ok(*gas),
            None => bail!("no receipt for {}", hash),
        }
    }
}

// =============================================================================
// Prices
// =============================================================================

/// Same rate for every timestamp at or after `available_from`
pub struct FixedPriceResolver {
    pub rate: PriceRate,
    pub available_from: i64,
}

impl FixedPriceResolver {
    pub fn new(rate: PriceRate) -> Self {
        Self {
            rate,
            available_from: i64::MIN,
        }
    }
}

impl PriceResolver for FixedPriceResolver {
    fn resolve(&self, timestamp: i64) -> Option<PriceRate> {
        (timestamp >= self.available_from).then_some(self.rate)
    }
}

// =============================================================================
// Claim Status
// =============================================================================

/// Epochs marked claimed; `override_len` returns a bitmap of the wrong length
#[derive(Default)]
pub struct FakeClaimStatus {
    pub claimed: HashSet<u64>,
    pub override_len: Option<usize>,
}

#[async_trait]
impl ClaimStatusReader for FakeClaimStatus {
    async fn claim_status(&self, _address: Address, start_epoch: u64, end_epoch: u64) -> Result<Vec<bool>> {
        let mut bits: Vec<bool> = (start_epoch..=end_epoch)
            .map(|epoch| self.claimed.contains(&epoch))
            .collect();
        if let Some(len) = self.override_len {
            bits.resize(len, false);
        }
        Ok(bits)
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct MemoryState {
    transactions: BTreeMap<(u64, u64, B256), RefundTransaction>,
    records: BTreeMap<(u64, u64, Address), RefundRecord>,
    checkpoints: HashMap<(u64, u64, String), i64>,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transactions(&self) -> Vec<RefundTransaction> {
        self.state().transactions.values().cloned().collect()
    }

    pub fn records(&self) -> Vec<RefundRecord> {
        self.state().records.values().cloned().collect()
    }

    pub fn record(&self, chain_id: u64, epoch: u64, address: Address) -> Option<RefundRecord> {
        self.state().records.get(&(chain_id, epoch, address)).cloned()
    }

    /// Number of write calls that carried at least one row
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn insert_record(&self, record: RefundRecord) {
        self.state()
            .records
            .insert((record.chain_id, record.epoch, record.address), record);
    }
}

#[async_trait]
impl RefundStore for MemoryStore {
    async fn last_processed_timestamp(&self, chain_id: u64, epoch: u64, contract: &str) -> Result<i64> {
        let state = self.state();
        let from_rows = state
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.epoch == epoch && tx.contract == contract)
            .map(|tx| tx.timestamp)
            .max()
            .unwrap_or(0);
        let checkpoint = state
            .checkpoints
            .get(&(chain_id, epoch, contract.to_string()))
            .copied()
            .unwrap_or(0);
        Ok(from_rows.max(checkpoint))
    }

    async fn write_window(
        &self,
        chain_id: u64,
        epoch: u64,
        contract: &str,
        rows: &[RefundTransaction],
        checkpoint: i64,
    ) -> Result<()> {
        let mut state = self.state();
        if !rows.is_empty() {
            state.writes += 1;
        }
        for row in rows {
            let mut stored = row.clone();
            stored.refunded_amount_token = round_base_units(stored.refunded_amount_token);
            state.transactions.insert((row.chain_id, row.epoch, row.hash), stored);
        }
        state
            .checkpoints
            .insert((chain_id, epoch, contract.to_string()), checkpoint);
        Ok(())
    }

    async fn pending_records(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundRecord>> {
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| r.chain_id == chain_id && r.epoch == epoch && !r.is_completed)
            .cloned()
            .collect())
    }

    async fn epoch_records(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundRecord>> {
        let mut records: Vec<RefundRecord> = self
            .state()
            .records
            .values()
            .filter(|r| r.chain_id == chain_id && r.epoch == epoch)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.address);
        Ok(records)
    }

    async fn write_records(&self, records: &[RefundRecord]) -> Result<()> {
        let mut state = self.state();
        if !records.is_empty() {
            state.writes += 1;
        }
        for record in records {
            let key = (record.chain_id, record.epoch, record.address);
            if state.records.get(&key).is_some_and(|r| r.is_completed) {
                continue;
            }
            let mut stored = record.clone();
            stored.refunded_amount_token = round_base_units(stored.refunded_amount_token);
            state.records.insert(key, stored);
        }
        Ok(())
    }

    async fn completed_refunds(&self, chain_id: u64, address: Address) -> Result<Vec<CompletedRefund>> {
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| r.chain_id == chain_id && r.address == address && r.is_completed)
            .map(|r| CompletedRefund {
                epoch: r.epoch,
                address: r.address,
                amount: r.refunded_amount_token,
                merkle_proof: r.merkle_proof.clone(),
            })
            .collect())
    }

    async fn pending_refunded_amounts(&self, chain_id: u64, epoch: u64, address: Address) -> Result<Vec<Decimal>> {
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| {
                r.chain_id == chain_id && r.epoch == epoch && r.address == address && !r.is_completed
            })
            .map(|r| r.refunded_amount_token)
            .collect())
    }
}
