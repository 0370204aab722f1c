//! Swap fee accumulation into one evolving record per address
//!
//! Stake and gas lookups of a window run concurrently. Charging is done by
//! a single writer that walks the window's swaps in chain order, so the
//! budget and the running aggregates of an address are only ever mutated
//! by one task.

use alloy::primitives::Address;
use anyhow::Result;
use futures::{StreamExt, TryStreamExt, stream};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::BudgetGuardian;
use crate::constants::ONE_HOUR_SEC;
use crate::epochs::{EpochRules, StakeAlgorithm};
use crate::error::RefundError;
use crate::http::with_timeout;
use crate::indexer::StopReason;
use crate::prices::PriceResolver;
use crate::sources::SwapSource;
use crate::stakes::{MissingStakePolicy, StakePool, StakeSnapshot, VersionedStakeResolver};
use crate::store::RefundStore;
use crate::time::{slice_windows, start_of_hour};
use crate::types::{round_base_units, GasCost, RefundRecord, SwapTransaction};

#[derive(Debug, Clone)]
pub struct AccumulatorSettings {
    pub slice_duration_secs: i64,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub unified_chain_id: u64,
    pub missing_policy: MissingStakePolicy,
}

#[derive(Debug, Clone)]
pub struct AccumulationSummary {
    pub resumed_from: i64,
    pub windows: usize,
    pub swaps: usize,
    pub charged: usize,
    pub addresses: usize,
    pub stop: StopReason,
}

/// A swap with everything needed to charge it
struct Eligible {
    swap: SwapTransaction,
    stake: Decimal,
    gas_used: u64,
}

type HourlySnapshots = HashMap<i64, Option<Arc<StakeSnapshot>>>;

pub struct SwapFeeAccumulator {
    resolver: Arc<VersionedStakeResolver>,
    rules: Arc<EpochRules>,
    swaps: Arc<dyn SwapSource>,
    store: Arc<dyn RefundStore>,
    budget: Arc<BudgetGuardian>,
    settings: AccumulatorSettings,
    cancel: CancellationToken,
}

impl SwapFeeAccumulator {
    pub fn new(
        resolver: Arc<VersionedStakeResolver>,
        rules: Arc<EpochRules>,
        swaps: Arc<dyn SwapSource>,
        store: Arc<dyn RefundStore>,
        budget: Arc<BudgetGuardian>,
        settings: AccumulatorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            rules,
            swaps,
            store,
            budget,
            settings,
            cancel,
        }
    }

    /// Snapshot pool sampled at hour boundaries for the epoch's algorithm
    fn snapshot_pool(&self, algorithm: StakeAlgorithm) -> StakePool {
        match algorithm {
            StakeAlgorithm::Unified => StakePool::Unified {
                chain_id: self.settings.unified_chain_id,
            },
            _ => StakePool::Staking,
        }
    }

    /// Accumulate swap fee refunds over `[start, end)`, resuming after the
    /// latest swap already folded into the epoch's aggregates.
    pub async fn accumulate(
        &self,
        chain_id: u64,
        start: i64,
        end: i64,
        epoch: u64,
        prices: &dyn PriceResolver,
    ) -> Result<AccumulationSummary> {
        let algorithm = self.resolver.algorithm(epoch)?;
        let pool = self.snapshot_pool(algorithm);

        // Completed records are final: they count against the budget but are never charged again
        let records = self.store.epoch_records(chain_id, epoch).await?;
        self.budget.reset();
        self.budget.seed(&records);

        let last_processed = records.iter().map(|r| r.last_timestamp).max().unwrap_or(0);
        let resume = start.max(last_processed + 1);
        let completed: BTreeSet<Address> =
            records.iter().filter(|r| r.is_completed).map(|r| r.address).collect();
        let mut aggregates: HashMap<Address, RefundRecord> = records
            .into_iter()
            .filter(|r| !r.is_completed)
            .map(|r| (r.address, r))
            .collect();

        info!(
            chain_id,
            epoch,
            start = resume,
            end,
            pending = aggregates.len(),
            completed = completed.len(),
            "start swap accumulation"
        );

        let mut summary = AccumulationSummary {
            resumed_from: resume,
            windows: 0,
            swaps: 0,
            charged: 0,
            addresses: 0,
            stop: StopReason::Completed,
        };

        for window in slice_windows(resume, end, self.settings.slice_duration_secs) {
            if self.cancel.is_cancelled() {
                info!(chain_id, epoch, "cancelled, stopping before window {}", window.start);
                summary.stop = StopReason::Cancelled;
                break;
            }
            if self.budget.is_global_exhausted() {
                warn!(chain_id, epoch, "max token global budget spent, preventing further processing");
                summary.stop = StopReason::BudgetExhausted;
                break;
            }

            let swaps = with_timeout(
                self.settings.fetch_timeout,
                "swaps fetch",
                self.swaps.successful_swaps(chain_id, window.start, window.end),
            )
            .await?;
            debug!(chain_id, from = window.start, to = window.end, count = swaps.len(), "fetched swaps");
            summary.swaps += swaps.len();

            let snapshots = self.fetch_snapshots(pool, &swaps, end).await?;
            let mut eligible = self.resolve_eligible(chain_id, epoch, swaps, &snapshots).await?;
            eligible.sort_by(|a, b| {
                (a.swap.timestamp, a.swap.block_number, a.swap.hash)
                    .cmp(&(b.swap.timestamp, b.swap.block_number, b.swap.hash))
            });

            let mut touched = BTreeSet::new();
            let mut exhausted = false;
            for item in eligible {
                let address = item.swap.tx_origin;
                if self.budget.is_global_exhausted() {
                    warn!(chain_id, epoch, "max token global budget spent, preventing further processing");
                    exhausted = true;
                    break;
                }
                if completed.contains(&address) {
                    debug!(%address, hash = %item.swap.hash, "refund record already completed, skipping swap");
                    continue;
                }
                if self.budget.is_account_exhausted(address) {
                    warn!(%address, "max budget already spent for account");
                    continue;
                }

                self.charge(chain_id, epoch, &item, prices, &mut aggregates)?;
                touched.insert(address);
                summary.charged += 1;
            }

            let updated: Vec<RefundRecord> = touched
                .iter()
                .filter_map(|address| aggregates.get(address).cloned())
                .collect();
            if !updated.is_empty() {
                info!(chain_id, epoch, from = window.start, to = window.end, count = updated.len(), "updating pending refund records");
                self.store.write_records(&updated).await?;
            }
            summary.windows += 1;

            if exhausted {
                summary.stop = StopReason::BudgetExhausted;
                break;
            }
        }

        summary.addresses = aggregates.len();
        info!(chain_id, epoch, addresses = summary.addresses, charged = summary.charged, "swap accumulation done");
        Ok(summary)
    }

    /// Hour snapshots covering every swap's start-of-hour and start-of-next-hour
    async fn fetch_snapshots(&self, pool: StakePool, swaps: &[SwapTransaction], end: i64) -> Result<HourlySnapshots> {
        let mut hours = BTreeSet::new();
        for swap in swaps {
            let hour = start_of_hour(swap.timestamp);
            hours.insert(hour);
            // Next hour is only sampled while it is inside the processed range
            if hour + ONE_HOUR_SEC < end {
                hours.insert(hour + ONE_HOUR_SEC);
            }
        }

        let source = self.resolver.source();
        stream::iter(hours)
            .map(|hour| async move {
                let snapshot = with_timeout(
                    self.settings.fetch_timeout,
                    "stake snapshot fetch",
                    source.snapshot(pool, hour),
                )
                .await?;
                Ok::<_, anyhow::Error>((hour, snapshot))
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .try_collect()
            .await
    }

    fn snapshot_balance(&self, snapshots: &HourlySnapshots, pool: StakePool, hour: i64, address: &Address, required: bool) -> Result<Decimal> {
        match snapshots.get(&hour) {
            Some(Some(snapshot)) => Ok(snapshot.get(address).copied().unwrap_or(Decimal::ZERO)),
            Some(None) if required && self.settings.missing_policy == MissingStakePolicy::Abort => {
                Err(RefundError::MissingStakeData { pool, timestamp: hour }.into())
            }
            _ => Ok(Decimal::ZERO),
        }
    }

    async fn resolve_eligible(
        &self,
        chain_id: u64,
        epoch: u64,
        swaps: Vec<SwapTransaction>,
        snapshots: &HourlySnapshots,
    ) -> Result<Vec<Eligible>> {
        let algorithm = self.resolver.algorithm(epoch)?;
        let pool = self.snapshot_pool(algorithm);

        let resolved: Vec<Option<Eligible>> = stream::iter(swaps)
            .map(|swap| async move {
                let address = swap.tx_origin;
                let hour = start_of_hour(swap.timestamp);
                let at_hour = self.snapshot_balance(snapshots, pool, hour, &address, true)?;
                let at_next_hour =
                    self.snapshot_balance(snapshots, pool, hour + ONE_HOUR_SEC, &address, false)?;

                let mut stake = at_hour.max(at_next_hour);
                if algorithm.has_safety_module() {
                    stake += with_timeout(
                        self.settings.fetch_timeout,
                        "safety module stake lookup",
                        self.resolver.safety_module_stake(address, swap.timestamp, epoch),
                    )
                    .await?;
                }

                if stake.is_zero() {
                    debug!(%address, hash = %swap.hash, "no stake, skipping swap");
                    return Ok(None);
                }

                let gas_used = with_timeout(
                    self.settings.fetch_timeout,
                    "gas used lookup",
                    self.swaps.gas_used(chain_id, swap.hash),
                )
                .await?;

                Ok::<_, anyhow::Error>(Some(Eligible {
                    swap,
                    stake,
                    gas_used,
                }))
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .try_collect()
            .await?;

        Ok(resolved.into_iter().flatten().collect())
    }

    /// Clip through the guardian and fold one swap into its address's aggregate
    fn charge(
        &self,
        chain_id: u64,
        epoch: u64,
        item: &Eligible,
        prices: &dyn PriceResolver,
        aggregates: &mut HashMap<Address, RefundRecord>,
    ) -> Result<()> {
        let swap = &item.swap;
        let address = swap.tx_origin;

        let rate = prices
            .resolve(swap.timestamp)
            .ok_or(RefundError::MissingPriceRate {
                timestamp: swap.timestamp,
            })?;

        let total_stake = round_base_units(item.stake);
        let percent = self
            .rules
            .unified_refund_percent(total_stake)
            .ok_or(RefundError::MissingRefundPercent { address, epoch })?;

        let cost = GasCost::compute(item.gas_used, swap.gas_price, &rate);
        let (token, usd) = cost.refund(percent);
        let charge = self.budget.charge(address, round_base_units(token), usd, &rate)?;

        let record = aggregates.entry(address).or_insert_with(|| RefundRecord {
            epoch,
            address,
            chain_id,
            accumulated_gas_used: Decimal::ZERO,
            accumulated_gas_used_chain_currency: Decimal::ZERO,
            accumulated_gas_used_usd: Decimal::ZERO,
            accumulated_gas_used_token: Decimal::ZERO,
            total_stake_amount: Decimal::ZERO,
            refunded_amount_token: Decimal::ZERO,
            refunded_amount_usd: Decimal::ZERO,
            first_block: swap.block_number,
            last_block: swap.block_number,
            first_tx: swap.hash,
            last_tx: swap.hash,
            first_timestamp: swap.timestamp,
            last_timestamp: swap.timestamp,
            transaction_count: 0,
            is_completed: false,
            merkle_proof: Vec::new(),
        });

        record.accumulated_gas_used += Decimal::from(item.gas_used);
        record.accumulated_gas_used_chain_currency += cost.chain_currency;
        record.accumulated_gas_used_usd += cost.usd;
        record.accumulated_gas_used_token += round_base_units(cost.token);
        record.total_stake_amount = total_stake;
        record.refunded_amount_token += charge.token;
        record.refunded_amount_usd += charge.usd;
        record.last_block = swap.block_number;
        record.last_tx = swap.hash;
        record.last_timestamp = swap.timestamp;
        record.transaction_count += 1;

        debug!(%address, hash = %swap.hash, token = %charge.token, usd = %charge.usd, clipped = charge.clipped, "charged swap");
        Ok(())
    }
}
