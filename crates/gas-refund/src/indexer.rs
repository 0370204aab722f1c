//! Windowed per-contract refund indexing
//!
//! Each monitored contract resumes from its own checkpoint and walks its
//! time range in fixed windows, strictly in order. A window's rows and its
//! checkpoint are persisted together, so a crash never leaves a window half
//! written and a rerun never refetches a finished one. Contracts run
//! concurrently up to the configured bound.

use anyhow::{anyhow, Result};
use futures::{StreamExt, TryStreamExt, stream};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetGuardian;
use crate::epochs::EpochRules;
use crate::error::RefundError;
use crate::http::with_timeout;
use crate::prices::PriceResolver;
use crate::sources::TransactionSource;
use crate::stakes::VersionedStakeResolver;
use crate::store::RefundStore;
use crate::time::{slice_windows, Window};
use crate::types::{
    round_base_units, GasCost, RefundTransaction, RefundableTransaction, TransactionStatus,
};

#[derive(Debug, Clone)]
/// At most `contract_concurrency * lookup_concurrency` stake lookups are in flight
pub struct IndexerSettings {
    pub slice_duration_secs: i64,
    /// Contracts indexed at the same time
    pub contract_concurrency: usize,
    /// Transactions of one window resolved at the same time
    pub lookup_concurrency: usize,
    pub fetch_timeout: Duration,
    /// Contract key whose transactions are always refunded at 100%
    pub migration_contract_key: String,
}

/// Why a contract stopped before the end of the range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    BudgetExhausted,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::BudgetExhausted => f.write_str("budget exhausted"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContractProgress {
    pub contract: String,
    pub resumed_from: i64,
    pub windows: usize,
    pub fetched: usize,
    pub written: usize,
    pub stop: StopReason,
}

pub struct WindowedRefundIndexer {
    resolver: Arc<VersionedStakeResolver>,
    rules: Arc<EpochRules>,
    transactions: Arc<dyn TransactionSource>,
    store: Arc<dyn RefundStore>,
    budget: Arc<BudgetGuardian>,
    contracts: HashMap<u64, Vec<String>>,
    settings: IndexerSettings,
    cancel: CancellationToken,
}

impl WindowedRefundIndexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<VersionedStakeResolver>,
        rules: Arc<EpochRules>,
        transactions: Arc<dyn TransactionSource>,
        store: Arc<dyn RefundStore>,
        budget: Arc<BudgetGuardian>,
        contracts: HashMap<u64, Vec<String>>,
        settings: IndexerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            rules,
            transactions,
            store,
            budget,
            contracts,
            settings,
            cancel,
        }
    }

    /// Index `[start, end)` for every contract monitored on the chain.
    ///
    /// A failing contract does not stop the others; the first failure is
    /// returned once every contract has finished.
    pub async fn index(
        &self,
        chain_id: u64,
        start: i64,
        end: i64,
        epoch: u64,
        prices: &dyn PriceResolver,
    ) -> Result<Vec<ContractProgress>> {
        let contracts = self
            .contracts
            .get(&chain_id)
            .ok_or_else(|| anyhow!("no contracts monitored on chain {}", chain_id))?;

        info!(chain_id, epoch, start, end, contracts = contracts.len(), "start indexing");

        let results: Vec<(String, Result<ContractProgress>)> = stream::iter(contracts)
            .map(|contract| async move {
                let result = self
                    .index_contract(chain_id, contract, start, end, epoch, prices)
                    .await;
                (contract.clone(), result)
            })
            .buffer_unordered(self.settings.contract_concurrency.max(1))
            .collect()
            .await;

        let mut progress = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (contract, result) in results {
            match result {
                Ok(p) => progress.push(p),
                Err(e) => {
                    error!(chain_id, epoch, %contract, "indexing failed: {:#}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                progress.sort_by(|a, b| a.contract.cmp(&b.contract));
                Ok(progress)
            }
        }
    }

    async fn index_contract(
        &self,
        chain_id: u64,
        contract: &str,
        start: i64,
        end: i64,
        epoch: u64,
        prices: &dyn PriceResolver,
    ) -> Result<ContractProgress> {
        let last_processed = self
            .store
            .last_processed_timestamp(chain_id, epoch, contract)
            .await?;
        let resume = start.max(last_processed + 1);

        let mut progress = ContractProgress {
            contract: contract.to_string(),
            resumed_from: resume,
            windows: 0,
            fetched: 0,
            written: 0,
            stop: StopReason::Completed,
        };

        if resume > start {
            info!(chain_id, epoch, contract, resume, "resuming after checkpoint");
        }

        for window in slice_windows(resume, end, self.settings.slice_duration_secs) {
            if self.cancel.is_cancelled() {
                info!(chain_id, epoch, contract, "cancelled, stopping before window {}", window.start);
                progress.stop = StopReason::Cancelled;
                break;
            }
            if self.budget.is_global_exhausted() {
                warn!(chain_id, epoch, contract, "max token global budget spent, stopping");
                progress.stop = StopReason::BudgetExhausted;
                break;
            }

            let transactions = with_timeout(
                self.settings.fetch_timeout,
                "transactions fetch",
                self.transactions
                    .transactions(chain_id, contract, window.start, window.end),
            )
            .await?;
            debug!(
                chain_id,
                contract,
                from = window.start,
                to = window.end,
                count = transactions.len(),
                "fetched transactions"
            );
            progress.fetched += transactions.len();

            let rows = self
                .process_window(chain_id, epoch, contract, &window, transactions, prices)
                .await?;

            // Checkpoint is the last second covered, written even when nothing qualified
            self.store
                .write_window(chain_id, epoch, contract, &rows, window.end - 1)
                .await?;

            if !rows.is_empty() {
                info!(chain_id, epoch, contract, from = window.start, to = window.end, rows = rows.len(), "wrote refund rows");
            }
            progress.windows += 1;
            progress.written += rows.len();
        }

        Ok(progress)
    }

    async fn process_window(
        &self,
        chain_id: u64,
        epoch: u64,
        contract: &str,
        window: &Window,
        transactions: Vec<RefundableTransaction>,
        prices: &dyn PriceResolver,
    ) -> Result<Vec<RefundTransaction>> {
        let min_stake = self.rules.min_stake(epoch)?;

        let rows: Vec<Option<RefundTransaction>> = stream::iter(transactions)
            .map(|tx| self.process_transaction(chain_id, epoch, contract, min_stake, tx, prices))
            .buffered(self.settings.lookup_concurrency.max(1))
            .try_collect()
            .await
            .map_err(|e| e.context(format!("window {}..{} of {}", window.start, window.end, contract)))?;

        Ok(rows.into_iter().flatten().collect())
    }

    async fn process_transaction(
        &self,
        chain_id: u64,
        epoch: u64,
        contract: &str,
        min_stake: Decimal,
        tx: RefundableTransaction,
        prices: &dyn PriceResolver,
    ) -> Result<Option<RefundTransaction>> {
        let address = tx.tx_origin;

        let stake = with_timeout(
            self.settings.fetch_timeout,
            "stake lookup",
            self.resolver.resolve(address, tx.timestamp, epoch),
        )
        .await?;

        if stake < min_stake {
            debug!(%address, hash = %tx.hash, %stake, "below minimum stake, skipping");
            return Ok(None);
        }

        let rate = prices
            .resolve(tx.timestamp)
            .ok_or(RefundError::MissingPriceRate {
                timestamp: tx.timestamp,
            })?;

        let total_stake = round_base_units(stake);
        let percent = if contract == self.settings.migration_contract_key {
            Decimal::ONE
        } else {
            match self.rules.refund_percent(epoch, total_stake) {
                Some(percent) => percent,
                None if self.rules.requires_refund_percent(epoch) => {
                    return Err(RefundError::MissingRefundPercent { address, epoch }.into());
                }
                None => Decimal::ZERO,
            }
        };

        let cost = GasCost::compute(tx.gas_used, tx.gas_price, &rate);
        let (refunded_token, refunded_usd) = cost.refund(percent);

        Ok(Some(RefundTransaction {
            epoch,
            address,
            chain_id,
            hash: tx.hash,
            block_number: tx.block_number,
            timestamp: tx.timestamp,
            gas_used: tx.gas_used,
            gas_price: tx.gas_price,
            gas_used_chain_currency: cost.chain_currency,
            token_usd: rate.token_usd,
            chain_currency_usd: rate.chain_currency_usd,
            token_per_chain_currency: rate.token_per_chain_currency,
            gas_used_usd: cost.usd,
            total_stake_amount: total_stake,
            refunded_amount_token: refunded_token,
            refunded_amount_usd: refunded_usd,
            contract: tx.contract,
            status: TransactionStatus::Idle,
        }))
    }
}
