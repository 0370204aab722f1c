//! SQLite persistence for refund rows, aggregates, checkpoints and prices
//!
//! Decimal quantities are stored as TEXT so base-unit amounts keep full
//! precision. Every batch is written inside one SQL transaction.

use alloy::primitives::{Address, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::types::{
    round_base_units, CompletedRefund, PriceRate, RefundRecord, RefundTransaction,
    TransactionStatus,
};

/// Persistence contract of the accumulation paths and the claim resolver
#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Latest timestamp covered for a contract in an epoch, 0 when nothing was processed
    async fn last_processed_timestamp(&self, chain_id: u64, epoch: u64, contract: &str) -> Result<i64>;

    /// Persist one window's rows together with the contract checkpoint
    async fn write_window(
        &self,
        chain_id: u64,
        epoch: u64,
        contract: &str,
        rows: &[RefundTransaction],
        checkpoint: i64,
    ) -> Result<()>;

    async fn pending_records(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundRecord>>;

    /// Every aggregate of an epoch, completed or not
    async fn epoch_records(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundRecord>>;

    /// Upsert pending aggregates. Completed records are never overwritten.
    async fn write_records(&self, records: &[RefundRecord]) -> Result<()>;

    async fn completed_refunds(&self, chain_id: u64, address: Address) -> Result<Vec<CompletedRefund>>;

    async fn pending_refunded_amounts(&self, chain_id: u64, epoch: u64, address: Address) -> Result<Vec<Decimal>>;
}

/// Merkle distribution file of one closed epoch
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleDistribution {
    pub root: MerkleRoot,
    pub merkle_proofs: Vec<MerkleLeaf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleRoot {
    pub merkle_root: B256,
    pub total_amount: Decimal,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MerkleLeaf {
    pub proof: Vec<B256>,
    pub address: Address,
    pub amount: Decimal,
    pub epoch: u64,
}

/// Refund database wrapper
pub struct Store {
    pool: SqlitePool,
}

/// Row type for refund_transactions query
#[derive(FromRow)]
struct TransactionRow {
    epoch: i64,
    address: String,
    chain_id: i64,
    hash: String,
    block_number: i64,
    timestamp: i64,
    gas_used: i64,
    gas_price: String,
    gas_used_chain_currency: String,
    token_usd: String,
    chain_currency_usd: String,
    token_per_chain_currency: String,
    gas_used_usd: String,
    total_stake_amount: String,
    refunded_amount_token: String,
    refunded_amount_usd: String,
    contract: String,
    status: String,
}

/// Row type for refund_records query
#[derive(FromRow)]
struct RecordRow {
    epoch: i64,
    address: String,
    chain_id: i64,
    accumulated_gas_used: String,
    accumulated_gas_used_chain_currency: String,
    accumulated_gas_used_usd: String,
    accumulated_gas_used_token: String,
    total_stake_amount: String,
    refunded_amount_token: String,
    refunded_amount_usd: String,
    first_block: i64,
    last_block: i64,
    first_tx: String,
    last_tx: String,
    first_timestamp: i64,
    last_timestamp: i64,
    transaction_count: i64,
    is_completed: bool,
    merkle_proof: String,
}

/// Row type for prices query
#[derive(FromRow)]
struct PriceRow {
    date: String,
    token_usd: String,
    chain_currency_usd: String,
    token_per_chain_currency: String,
}

const RECORD_COLUMNS: &str = "epoch, address, chain_id, accumulated_gas_used,
    accumulated_gas_used_chain_currency, accumulated_gas_used_usd, accumulated_gas_used_token,
    total_stake_amount, refunded_amount_token, refunded_amount_usd, first_block, last_block,
    first_tx, last_tx, first_timestamp, last_timestamp, transaction_count, is_completed,
    merkle_proof";

const TRANSACTION_COLUMNS: &str = "epoch, address, chain_id, hash, block_number, timestamp,
    gas_used, gas_price, gas_used_chain_currency, token_usd, chain_currency_usd,
    token_per_chain_currency, gas_used_usd, total_stake_amount, refunded_amount_token,
    refunded_amount_usd, contract, status";

impl Store {
    /// Open or create the refund database
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // SQLx requires the file to exist for SQLite
        if !path.exists() {
            std::fs::File::create(path)?;
        }

        let url = format!("sqlite:{}", path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .context("Failed to open refund database")?;

        // WAL plus busy timeout so concurrent readers don't hit SQLITE_BUSY
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "
            -- One row per qualifying transaction of the windowed indexer
            CREATE TABLE IF NOT EXISTS refund_transactions (
                epoch INTEGER NOT NULL,
                address TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                hash TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                gas_used INTEGER NOT NULL,
                gas_price TEXT NOT NULL,
                gas_used_chain_currency TEXT NOT NULL,
                token_usd TEXT NOT NULL,
                chain_currency_usd TEXT NOT NULL,
                token_per_chain_currency TEXT NOT NULL,
                gas_used_usd TEXT NOT NULL,
                total_stake_amount TEXT NOT NULL,
                refunded_amount_token TEXT NOT NULL,
                refunded_amount_usd TEXT NOT NULL,
                contract TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (chain_id, epoch, hash)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_contract
             ON refund_transactions(chain_id, epoch, contract, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "
            -- Per-address aggregates, completed by the epoch-closing import
            CREATE TABLE IF NOT EXISTS refund_records (
                epoch INTEGER NOT NULL,
                address TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                accumulated_gas_used TEXT NOT NULL DEFAULT '0',
                accumulated_gas_used_chain_currency TEXT NOT NULL DEFAULT '0',
                accumulated_gas_used_usd TEXT NOT NULL DEFAULT '0',
                accumulated_gas_used_token TEXT NOT NULL DEFAULT '0',
                total_stake_amount TEXT NOT NULL DEFAULT '0',
                refunded_amount_token TEXT NOT NULL DEFAULT '0',
                refunded_amount_usd TEXT NOT NULL DEFAULT '0',
                first_block INTEGER NOT NULL DEFAULT 0,
                last_block INTEGER NOT NULL DEFAULT 0,
                first_tx TEXT NOT NULL DEFAULT '',
                last_tx TEXT NOT NULL DEFAULT '',
                first_timestamp INTEGER NOT NULL DEFAULT 0,
                last_timestamp INTEGER NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                is_completed INTEGER NOT NULL DEFAULT 0,
                merkle_proof TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (chain_id, epoch, address)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "
            -- Highest timestamp processed per contract (even if no transaction qualified)
            CREATE TABLE IF NOT EXISTS contract_progress (
                chain_id INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                contract TEXT NOT NULL,
                last_timestamp INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (chain_id, epoch, contract)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "
            -- Daily price rates per chain
            CREATE TABLE IF NOT EXISTS prices (
                chain_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                token_usd TEXT NOT NULL,
                chain_currency_usd TEXT NOT NULL,
                token_per_chain_currency TEXT NOT NULL,
                fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (chain_id, date)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "
            -- Published Merkle roots
            CREATE TABLE IF NOT EXISTS distributions (
                chain_id INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                merkle_root TEXT NOT NULL,
                total_amount TEXT NOT NULL,
                imported_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (chain_id, epoch)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Refund Transactions
    // =========================================================================

    /// Per-transaction rows of an epoch, oldest first
    pub async fn epoch_transactions(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM refund_transactions
             WHERE chain_id = ? AND epoch = ?
             ORDER BY timestamp, hash"
        ))
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_transaction).collect()
    }

    // =========================================================================
    // Prices
    // =========================================================================

    /// Get cached daily rates of a chain
    pub async fn get_prices(&self, chain_id: u64) -> Result<BTreeMap<NaiveDate, PriceRate>> {
        let rows: Vec<PriceRow> = sqlx::query_as(
            "SELECT date, token_usd, chain_currency_usd, token_per_chain_currency
             FROM prices WHERE chain_id = ?",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let date = NaiveDate::parse_from_str(&r.date, "%Y-%m-%d")
                    .with_context(|| format!("Invalid price date {}", r.date))?;
                Ok((
                    date,
                    PriceRate {
                        token_usd: parse_decimal(&r.token_usd)?,
                        chain_currency_usd: parse_decimal(&r.chain_currency_usd)?,
                        token_per_chain_currency: parse_decimal(&r.token_per_chain_currency)?,
                    },
                ))
            })
            .collect()
    }

    /// Store daily rates (in a transaction for atomicity)
    pub async fn store_prices(&self, chain_id: u64, rates: &BTreeMap<NaiveDate, PriceRate>) -> Result<()> {
        if rates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for (date, rate) in rates {
            sqlx::query(
                "INSERT OR REPLACE INTO prices
                 (chain_id, date, token_usd, chain_currency_usd, token_per_chain_currency)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(chain_id as i64)
            .bind(date.format("%Y-%m-%d").to_string())
            .bind(rate.token_usd.to_string())
            .bind(rate.chain_currency_usd.to_string())
            .bind(rate.token_per_chain_currency.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Distributions
    // =========================================================================

    /// Store a Merkle root and mark its leaves' aggregates completed.
    /// Leaves without an aggregate (indexer-only epochs) get one holding the leaf amount.
    pub async fn import_distribution(&self, chain_id: u64, distribution: &MerkleDistribution) -> Result<usize> {
        let epoch = distribution.root.epoch;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO distributions (chain_id, epoch, merkle_root, total_amount)
             VALUES (?, ?, ?, ?)",
        )
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .bind(distribution.root.merkle_root.to_string())
        .bind(distribution.root.total_amount.to_string())
        .execute(&mut *tx)
        .await?;

        let mut count = 0;
        for leaf in &distribution.merkle_proofs {
            if leaf.epoch != epoch {
                anyhow::bail!(
                    "leaf for {} is in epoch {}, distribution root is for epoch {}",
                    leaf.address,
                    leaf.epoch,
                    epoch
                );
            }
            sqlx::query(
                "INSERT INTO refund_records
                 (epoch, address, chain_id, refunded_amount_token, is_completed, merkle_proof)
                 VALUES (?, ?, ?, ?, 1, ?)
                 ON CONFLICT (chain_id, epoch, address) DO UPDATE SET
                    refunded_amount_token = excluded.refunded_amount_token,
                    is_completed = 1,
                    merkle_proof = excluded.merkle_proof,
                    updated_at = datetime('now')",
            )
            .bind(epoch as i64)
            .bind(address_key(&leaf.address))
            .bind(chain_id as i64)
            .bind(leaf.amount.to_string())
            .bind(serde_json::to_string(&leaf.proof)?)
            .execute(&mut *tx)
            .await?;
            count += 1;
        }

        tx.commit().await?;
        Ok(count)
    }

    /// Root of an imported distribution
    pub async fn distribution_root(&self, chain_id: u64, epoch: u64) -> Result<Option<MerkleRoot>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT merkle_root, total_amount FROM distributions
             WHERE chain_id = ? AND epoch = ?",
        )
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(root, total)| {
            Ok(MerkleRoot {
                merkle_root: parse_hash(&root)?,
                total_amount: parse_decimal(&total)?,
                epoch,
            })
        })
        .transpose()
    }

    /// Epochs with an imported distribution, ascending
    pub async fn distribution_epochs(&self, chain_id: u64) -> Result<Vec<u64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT epoch FROM distributions WHERE chain_id = ? ORDER BY epoch",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(epoch,)| epoch as u64).collect())
    }

    // =========================================================================
    // Utilities
    // =========================================================================

    /// Get database statistics
    pub async fn stats(&self) -> Result<StoreStats> {
        let transactions: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM refund_transactions")
            .fetch_one(&self.pool)
            .await?;
        let records: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM refund_records")
            .fetch_one(&self.pool)
            .await?;
        let completed: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM refund_records WHERE is_completed = 1")
                .fetch_one(&self.pool)
                .await?;
        let checkpoints: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contract_progress")
            .fetch_one(&self.pool)
            .await?;
        let prices: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM prices")
            .fetch_one(&self.pool)
            .await?;
        let distributions: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM distributions")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            transactions: transactions.0 as u64,
            records: records.0 as u64,
            completed_records: completed.0 as u64,
            checkpoints: checkpoints.0 as u64,
            prices: prices.0 as u64,
            distributions: distributions.0 as u64,
        })
    }
}

#[async_trait]
impl RefundStore for Store {
    async fn last_processed_timestamp(&self, chain_id: u64, epoch: u64, contract: &str) -> Result<i64> {
        // Check both the checkpoint table and the rows, use the higher value
        let progress: Option<(i64,)> = sqlx::query_as(
            "SELECT last_timestamp FROM contract_progress
             WHERE chain_id = ? AND epoch = ? AND contract = ?",
        )
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .bind(contract)
        .fetch_optional(&self.pool)
        .await?;

        let from_rows: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(timestamp) FROM refund_transactions
             WHERE chain_id = ? AND epoch = ? AND contract = ?",
        )
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .bind(contract)
        .fetch_one(&self.pool)
        .await?;

        Ok(progress
            .map(|(t,)| t)
            .unwrap_or(0)
            .max(from_rows.0.unwrap_or(0)))
    }

    async fn write_window(
        &self,
        chain_id: u64,
        epoch: u64,
        contract: &str,
        rows: &[RefundTransaction],
        checkpoint: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO refund_transactions ({TRANSACTION_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(row.epoch as i64)
            .bind(address_key(&row.address))
            .bind(row.chain_id as i64)
            .bind(row.hash.to_string())
            .bind(row.block_number as i64)
            .bind(row.timestamp)
            .bind(row.gas_used as i64)
            .bind(row.gas_price.to_string())
            .bind(row.gas_used_chain_currency.to_string())
            .bind(row.token_usd.to_string())
            .bind(row.chain_currency_usd.to_string())
            .bind(row.token_per_chain_currency.to_string())
            .bind(row.gas_used_usd.to_string())
            .bind(row.total_stake_amount.to_string())
            .bind(round_base_units(row.refunded_amount_token).to_string())
            .bind(row.refunded_amount_usd.to_string())
            .bind(&row.contract)
            .bind(row.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO contract_progress (chain_id, epoch, contract, last_timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .bind(contract)
        .bind(checkpoint)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pending_records(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM refund_records
             WHERE chain_id = ? AND epoch = ? AND is_completed = 0"
        ))
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn epoch_records(&self, chain_id: u64, epoch: u64) -> Result<Vec<RefundRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM refund_records
             WHERE chain_id = ? AND epoch = ?
             ORDER BY address"
        ))
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn write_records(&self, records: &[RefundRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(&format!(
                "INSERT INTO refund_records ({RECORD_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, epoch, address) DO UPDATE SET
                    accumulated_gas_used = excluded.accumulated_gas_used,
                    accumulated_gas_used_chain_currency = excluded.accumulated_gas_used_chain_currency,
                    accumulated_gas_used_usd = excluded.accumulated_gas_used_usd,
                    accumulated_gas_used_token = excluded.accumulated_gas_used_token,
                    total_stake_amount = excluded.total_stake_amount,
                    refunded_amount_token = excluded.refunded_amount_token,
                    refunded_amount_usd = excluded.refunded_amount_usd,
                    first_block = excluded.first_block,
                    last_block = excluded.last_block,
                    first_tx = excluded.first_tx,
                    last_tx = excluded.last_tx,
                    first_timestamp = excluded.first_timestamp,
                    last_timestamp = excluded.last_timestamp,
                    transaction_count = excluded.transaction_count,
                    is_completed = excluded.is_completed,
                    merkle_proof = excluded.merkle_proof,
                    updated_at = datetime('now')
                 WHERE refund_records.is_completed = 0"
            ))
            .bind(record.epoch as i64)
            .bind(address_key(&record.address))
            .bind(record.chain_id as i64)
            .bind(record.accumulated_gas_used.to_string())
            .bind(record.accumulated_gas_used_chain_currency.to_string())
            .bind(record.accumulated_gas_used_usd.to_string())
            .bind(record.accumulated_gas_used_token.to_string())
            .bind(record.total_stake_amount.to_string())
            .bind(round_base_units(record.refunded_amount_token).to_string())
            .bind(record.refunded_amount_usd.to_string())
            .bind(record.first_block as i64)
            .bind(record.last_block as i64)
            .bind(record.first_tx.to_string())
            .bind(record.last_tx.to_string())
            .bind(record.first_timestamp)
            .bind(record.last_timestamp)
            .bind(record.transaction_count as i64)
            .bind(record.is_completed)
            .bind(serde_json::to_string(&record.merkle_proof)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn completed_refunds(&self, chain_id: u64, address: Address) -> Result<Vec<CompletedRefund>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT epoch, refunded_amount_token, merkle_proof FROM refund_records
             WHERE chain_id = ? AND address = ? AND is_completed = 1
             ORDER BY epoch",
        )
        .bind(chain_id as i64)
        .bind(address_key(&address))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(epoch, amount, proof)| {
                Ok(CompletedRefund {
                    epoch: epoch as u64,
                    address,
                    amount: parse_decimal(&amount)?,
                    merkle_proof: serde_json::from_str(&proof).context("Invalid merkle_proof")?,
                })
            })
            .collect()
    }

    async fn pending_refunded_amounts(&self, chain_id: u64, epoch: u64, address: Address) -> Result<Vec<Decimal>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT refunded_amount_token FROM refund_records
             WHERE chain_id = ? AND epoch = ? AND address = ? AND is_completed = 0",
        )
        .bind(chain_id as i64)
        .bind(epoch as i64)
        .bind(address_key(&address))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|(amount,)| parse_decimal(&amount)).collect()
    }
}

// =============================================================================
// Helper functions
// =============================================================================

/// Lowercase hex so lookups never depend on checksum casing
fn address_key(address: &Address) -> String {
    format!("{:#x}", address)
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal {:?}", value))
}

fn parse_hash(value: &str) -> Result<B256> {
    if value.is_empty() {
        return Ok(B256::ZERO);
    }
    B256::from_str(value).with_context(|| format!("Invalid hash {:?}", value))
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value).with_context(|| format!("Invalid address {:?}", value))
}

/// Convert a TransactionRow to a RefundTransaction
fn row_to_transaction(r: TransactionRow) -> Result<RefundTransaction> {
    Ok(RefundTransaction {
        epoch: r.epoch as u64,
        address: parse_address(&r.address)?,
        chain_id: r.chain_id as u64,
        hash: parse_hash(&r.hash)?,
        block_number: r.block_number as u64,
        timestamp: r.timestamp,
        gas_used: r.gas_used as u64,
        gas_price: r
            .gas_price
            .parse()
            .with_context(|| format!("Invalid gas price {:?}", r.gas_price))?,
        gas_used_chain_currency: parse_decimal(&r.gas_used_chain_currency)?,
        token_usd: parse_decimal(&r.token_usd)?,
        chain_currency_usd: parse_decimal(&r.chain_currency_usd)?,
        token_per_chain_currency: parse_decimal(&r.token_per_chain_currency)?,
        gas_used_usd: parse_decimal(&r.gas_used_usd)?,
        total_stake_amount: parse_decimal(&r.total_stake_amount)?,
        refunded_amount_token: parse_decimal(&r.refunded_amount_token)?,
        refunded_amount_usd: parse_decimal(&r.refunded_amount_usd)?,
        contract: r.contract,
        status: TransactionStatus::parse(&r.status),
    })
}

/// Convert a RecordRow to a RefundRecord
fn row_to_record(r: RecordRow) -> Result<RefundRecord> {
    Ok(RefundRecord {
        epoch: r.epoch as u64,
        address: parse_address(&r.address)?,
        chain_id: r.chain_id as u64,
        accumulated_gas_used: parse_decimal(&r.accumulated_gas_used)?,
        accumulated_gas_used_chain_currency: parse_decimal(&r.accumulated_gas_used_chain_currency)?,
        accumulated_gas_used_usd: parse_decimal(&r.accumulated_gas_used_usd)?,
        accumulated_gas_used_token: parse_decimal(&r.accumulated_gas_used_token)?,
        total_stake_amount: parse_decimal(&r.total_stake_amount)?,
        refunded_amount_token: parse_decimal(&r.refunded_amount_token)?,
        refunded_amount_usd: parse_decimal(&r.refunded_amount_usd)?,
        first_block: r.first_block as u64,
        last_block: r.last_block as u64,
        first_tx: parse_hash(&r.first_tx)?,
        last_tx: parse_hash(&r.last_tx)?,
        first_timestamp: r.first_timestamp,
        last_timestamp: r.last_timestamp,
        transaction_count: r.transaction_count as u64,
        is_completed: r.is_completed,
        merkle_proof: serde_json::from_str(&r.merkle_proof).context("Invalid merkle_proof")?,
    })
}

/// Database statistics
#[derive(Debug)]
pub struct StoreStats {
    pub transactions: u64,
    pub records: u64,
    pub completed_records: u64,
    pub checkpoints: u64,
    pub prices: u64,
    pub distributions: u64,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} refund transactions, {} records ({} completed), {} checkpoints, {} prices, {} distributions",
            self.transactions, self.records, self.completed_records, self.checkpoints, self.prices, self.distributions
        )
    }
}
