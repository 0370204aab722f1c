//! Gas refund program CLI
//!
//! Indexes refundable transactions and swaps per epoch, keeps daily price
//! rates cached, imports published Merkle distributions and answers claim
//! queries. All state lives in one SQLite database under the data directory.

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gas_refund::budget::BudgetGuardian;
use gas_refund::claims::{
    import_distribution_file, seed_allocations_for_epoch, MerkleClaimResolver, OnChainClaimStatus,
};
use gas_refund::config::{Config, FileConfig};
use gas_refund::constants;
use gas_refund::distributions::{sync_distributions, CachedDistributions, HttpDistributionSource};
use gas_refund::indexer::{ContractProgress, WindowedRefundIndexer};
use gas_refund::prices::{load_daily_rates, CoinGeckoClient, DailyPriceResolver};
use gas_refund::reports;
use gas_refund::sources::SubgraphSource;
use gas_refund::stakes::cached::CachedStakeSource;
use gas_refund::stakes::http::HttpStakeSource;
use gas_refund::stakes::VersionedStakeResolver;
use gas_refund::store::{RefundStore, Store};
use gas_refund::swaps::SwapFeeAccumulator;
use gas_refund::time::utc_date;

#[derive(Parser, Debug)]
#[command(name = "gas-refund")]
#[command(about = "Gas fee refunds for token stakers")]
struct Args {
    /// Path to config.toml
    #[arg(short, long, default_value = constants::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// Data directory for the refund database
    #[arg(short, long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index refundable transactions of every monitored contract
    Index {
        #[arg(long)]
        chain_id: u64,

        #[arg(long)]
        epoch: u64,

        /// Range start (unix seconds, inclusive)
        #[arg(long)]
        start: i64,

        /// Range end (unix seconds, exclusive)
        #[arg(long)]
        end: i64,
    },

    /// Accumulate swap fee refunds into per-address records
    Swaps {
        #[arg(long)]
        chain_id: u64,

        #[arg(long)]
        epoch: u64,

        /// Range start (unix seconds, inclusive)
        #[arg(long)]
        start: i64,

        /// Range end (unix seconds, exclusive)
        #[arg(long)]
        end: i64,
    },

    /// Fetch and cache daily price rates
    Prices {
        #[arg(long)]
        chain_id: u64,

        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Last day (YYYY-MM-DD, inclusive)
        #[arg(long)]
        end: NaiveDate,
    },

    /// Print the claimable refunds of an address as JSON
    Claims {
        #[arg(long)]
        chain_id: u64,

        #[arg(long)]
        address: Address,

        /// Epoch currently in progress
        #[arg(long)]
        current_epoch: u64,
    },

    /// Store a Merkle distribution and mark its records completed
    ImportDistribution {
        #[arg(long)]
        chain_id: u64,

        /// Path to the distribution JSON file
        file: PathBuf,
    },

    /// Import every published distribution missing from the database
    SyncDistributions {
        #[arg(long)]
        chain_id: u64,
    },

    /// Print every refund record of an epoch as JSON
    EpochEntries {
        #[arg(long)]
        chain_id: u64,

        #[arg(long)]
        epoch: u64,
    },

    /// Print the seedAllocations transaction for an imported epoch
    SeedTx {
        #[arg(long)]
        chain_id: u64,

        #[arg(long)]
        epoch: u64,
    },

    /// Export an epoch's refund records to CSV
    Export {
        #[arg(long)]
        chain_id: u64,

        #[arg(long)]
        epoch: u64,

        /// Path to output CSV file
        #[arg(long)]
        output: PathBuf,

        /// Also export the per-transaction rows to this file
        #[arg(long)]
        transactions: Option<PathBuf>,
    },

    /// Show database statistics
    Stats,
}

/// Load config file or exit with helpful message
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        bail!(
            "Config file '{}' not found.\n\n\
            To get started:\n\
            1. Copy config.toml.example to config.toml\n\
            2. Fill in your chains and API keys\n\n\
            See config.toml.example for the required format.",
            path.display()
        );
    }
    Config::from_file(&FileConfig::load(path)?)
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Cancel the token on Ctrl-C; runs stop before their next window
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current window");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    std::fs::create_dir_all(&args.data_dir)?;
    let store = Arc::new(Store::open(&args.data_dir.join(constants::DATABASE_FILENAME)).await?);

    match args.command {
        Command::Index {
            chain_id,
            epoch,
            start,
            end,
        } => {
            let config = load_config(&args.config)?;
            run_index(&config, store, chain_id, epoch, start, end).await
        }
        Command::Swaps {
            chain_id,
            epoch,
            start,
            end,
        } => {
            let config = load_config(&args.config)?;
            run_swaps(&config, store, chain_id, epoch, start, end).await
        }
        Command::Prices { chain_id, start, end } => {
            let config = load_config(&args.config)?;
            let rates = daily_rates(&config, &store, chain_id, start, end).await?;
            println!("{} daily rates cached for chain {}", rates.len(), chain_id);
            let missing = rates.missing_days(start, end);
            if !missing.is_empty() {
                println!("{} day(s) still without a rate, first: {}", missing.len(), missing[0]);
            }
            Ok(())
        }
        Command::Claims {
            chain_id,
            address,
            current_epoch,
        } => {
            let config = load_config(&args.config)?;
            let reader = OnChainClaimStatus::new(config.chain(chain_id)?)?;
            let resolver = MerkleClaimResolver::new(store, Arc::new(reader), chain_id, config.genesis_epoch);
            let response = resolver.claims_for_address(address, current_epoch).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Command::ImportDistribution { chain_id, file } => {
            let imported = import_distribution_file(&store, chain_id, &file).await?;
            println!("Imported {} leaves from {}", imported, file.display());
            Ok(())
        }
        Command::SyncDistributions { chain_id } => {
            let config = load_config(&args.config)?;
            let index_url = config
                .distributions_index_url
                .as_deref()
                .context("api.distributions_index_url is not configured")?;
            let source = Arc::new(HttpDistributionSource::new(reqwest::Client::new(), index_url));
            let remote = CachedDistributions::new(
                source,
                Duration::from_secs(constants::DISTRIBUTION_INDEX_TTL_SECS),
            );
            let imported = sync_distributions(&store, chain_id, &remote).await?;
            if imported.is_empty() {
                println!("Chain {} is up to date", chain_id);
            } else {
                println!("Imported epochs {:?} for chain {}", imported, chain_id);
            }
            Ok(())
        }
        Command::EpochEntries { chain_id, epoch } => {
            let config = load_config(&args.config)?;
            let reader = OnChainClaimStatus::new(config.chain(chain_id)?)?;
            let resolver = MerkleClaimResolver::new(store, Arc::new(reader), chain_id, config.genesis_epoch);
            let records = resolver.epoch_entries(epoch).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::SeedTx { chain_id, epoch } => {
            let config = load_config(&args.config)?;
            match seed_allocations_for_epoch(&store, config.chain(chain_id)?, epoch).await? {
                Some(seed) => println!("{}", serde_json::to_string_pretty(&seed)?),
                None => println!("No distribution imported for epoch {} on chain {}", epoch, chain_id),
            }
            Ok(())
        }
        Command::Export {
            chain_id,
            epoch,
            output,
            transactions,
        } => {
            let records = store.epoch_records(chain_id, epoch).await?;
            reports::export_records(&output, &records)?;
            println!("Wrote {} records to {}", records.len(), output.display());

            if let Some(path) = transactions {
                let rows = store.epoch_transactions(chain_id, epoch).await?;
                reports::export_transactions(&path, &rows)?;
                println!("Wrote {} transactions to {}", rows.len(), path.display());
            }

            print_summary(chain_id, epoch, &records);
            Ok(())
        }
        Command::Stats => {
            println!("{}", store.stats().await?);
            Ok(())
        }
    }
}

fn stake_resolver(config: &Config, client: &reqwest::Client) -> Arc<VersionedStakeResolver> {
    let http = Arc::new(HttpStakeSource::new(client.clone(), &config.stakes_api_url));
    let cached = Arc::new(CachedStakeSource::new(http, config.balance_cache_ttl));
    Arc::new(VersionedStakeResolver::new(
        cached,
        config.rules.algorithms.clone(),
        config.resolver_settings(),
    ))
}

async fn daily_rates(
    config: &Config,
    store: &Store,
    chain_id: u64,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<DailyPriceResolver> {
    let chain = config.chain(chain_id)?;
    let coingecko = CoinGeckoClient::new(reqwest::Client::new(), &config.coingecko_api_key);
    load_daily_rates(
        store,
        &coingecko,
        chain_id,
        &config.token_coingecko_id,
        &chain.chain_currency_coingecko_id,
        from,
        to,
    )
    .await
}

/// Days touched by `[start, end)`
fn range_days(start: i64, end: i64) -> Result<(NaiveDate, NaiveDate)> {
    if end <= start {
        bail!("empty range: start {} must be before end {}", start, end);
    }
    let from = utc_date(start).context("start out of range")?;
    let to = utc_date(end - 1).context("end out of range")?;
    Ok((from, to))
}

async fn run_index(config: &Config, store: Arc<Store>, chain_id: u64, epoch: u64, start: i64, end: i64) -> Result<()> {
    let (from, to) = range_days(start, end)?;
    let client = reqwest::Client::new();
    let prices = daily_rates(config, &store, chain_id, from, to).await?;

    let records = store.epoch_records(chain_id, epoch).await?;
    let budget = Arc::new(BudgetGuardian::seeded(config.budget, &records));

    let indexer = WindowedRefundIndexer::new(
        stake_resolver(config, &client),
        Arc::new(config.rules.clone()),
        Arc::new(SubgraphSource::new(client.clone(), &config.chains)?),
        store.clone(),
        budget,
        config.contracts_by_chain(),
        config.indexer_settings(),
        cancel_on_ctrl_c(),
    );

    info!(chain_id, epoch, start, end, "indexing refundable transactions");
    let progress = indexer.index(chain_id, start, end, epoch, &prices).await?;
    print_progress(&progress);

    let rows = store.epoch_transactions(chain_id, epoch).await?;
    println!("{} refund transactions stored for epoch {}", rows.len(), epoch);
    Ok(())
}

async fn run_swaps(config: &Config, store: Arc<Store>, chain_id: u64, epoch: u64, start: i64, end: i64) -> Result<()> {
    let (from, to) = range_days(start, end)?;
    let client = reqwest::Client::new();
    let prices = daily_rates(config, &store, chain_id, from, to).await?;

    let accumulator = SwapFeeAccumulator::new(
        stake_resolver(config, &client),
        Arc::new(config.rules.clone()),
        Arc::new(SubgraphSource::new(client.clone(), &config.chains)?),
        store.clone(),
        Arc::new(BudgetGuardian::new(config.budget)),
        config.accumulator_settings(),
        cancel_on_ctrl_c(),
    );

    let summary = accumulator.accumulate(chain_id, start, end, epoch, &prices).await?;
    println!(
        "Processed {} windows, {} swaps, {} charged ({})",
        summary.windows, summary.swaps, summary.charged, summary.stop
    );

    let records = store.epoch_records(chain_id, epoch).await?;
    print_summary(chain_id, epoch, &records);
    Ok(())
}

#[derive(Tabled)]
struct ProgressRow {
    #[tabled(rename = "Contract")]
    contract: String,
    #[tabled(rename = "Resumed From")]
    resumed_from: i64,
    #[tabled(rename = "Windows")]
    windows: usize,
    #[tabled(rename = "Fetched")]
    fetched: usize,
    #[tabled(rename = "Written")]
    written: usize,
    #[tabled(rename = "Stop")]
    stop: String,
}

fn print_progress(progress: &[ContractProgress]) {
    if progress.is_empty() {
        println!("No contracts monitored on this chain.");
        return;
    }
    let rows: Vec<ProgressRow> = progress
        .iter()
        .map(|p| ProgressRow {
            contract: p.contract.clone(),
            resumed_from: p.resumed_from,
            windows: p.windows,
            fetched: p.fetched,
            written: p.written,
            stop: p.stop.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn print_summary(chain_id: u64, epoch: u64, records: &[gas_refund::types::RefundRecord]) {
    let summary = reports::summarize(chain_id, epoch, records);
    println!("{}", Table::new([summary]).with(Style::rounded()));
}
