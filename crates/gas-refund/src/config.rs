//! Configuration for the gas refund program

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::budget::BudgetLimits;
use crate::constants;
use crate::epochs::{EpochRules, EpochTable, RefundTier, RefundTiers, StakeAlgorithm};
use crate::indexer::IndexerSettings;
use crate::stakes::{MissingStakePolicy, ResolverSettings};
use crate::swaps::AccumulatorSettings;
use crate::types::whole_tokens;

// =============================================================================
// File-based Configuration (config.toml)
// =============================================================================

/// Configuration loaded from config.toml
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub program: ProgramConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Overrides the built-in algorithm table when non-empty
    #[serde(default)]
    pub stake_algorithms: Vec<AlgorithmRow>,
    #[serde(default)]
    pub min_stake: Vec<MinStakeRow>,
    #[serde(default)]
    pub refund_tiers: Vec<TierRow>,
    #[serde(default)]
    pub unified_tiers: Option<UnifiedTiers>,
    pub chains: Vec<ChainConfig>,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub genesis_epoch: u64,
    /// Chain whose consolidated stakes are used from the unified epoch on
    pub unified_chain_id: u64,
    pub slice_duration_secs: i64,
    pub virtual_lockup_secs: i64,
    pub missing_stake_policy: MissingStakePolicy,
    /// Stake and gas lookups in flight per contract or swap window
    pub concurrency: usize,
    /// Contracts indexed at the same time
    pub contract_concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub migration_contract_key: String,
    /// TTL of cached exact balances
    pub balance_cache_ttl_secs: u64,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            genesis_epoch: constants::GENESIS_EPOCH,
            unified_chain_id: 1,
            slice_duration_secs: constants::DEFAULT_SLICE_DURATION_SEC,
            virtual_lockup_secs: constants::DEFAULT_VIRTUAL_LOCKUP_SEC,
            missing_stake_policy: MissingStakePolicy::default(),
            concurrency: constants::DEFAULT_CONCURRENCY,
            contract_concurrency: constants::DEFAULT_CONTRACT_CONCURRENCY,
            fetch_timeout_secs: constants::DEFAULT_FETCH_TIMEOUT_SECS,
            migration_contract_key: constants::MIGRATION_100_PERCENT_KEY.to_string(),
            balance_cache_ttl_secs: constants::ONE_HOUR_SEC as u64,
        }
    }
}

/// Budget section; both caps fall back to the protocol defaults
#[derive(Debug, Default, Deserialize)]
pub struct BudgetConfig {
    /// Token base units
    pub max_token_global: Option<Decimal>,
    pub max_usd_per_account: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct AlgorithmRow {
    pub from_epoch: u64,
    pub algorithm: StakeAlgorithm,
}

#[derive(Debug, Deserialize)]
pub struct MinStakeRow {
    pub from_epoch: u64,
    /// Token base units
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TierRow {
    pub from_epoch: u64,
    pub tiers: Vec<RefundTier>,
}

#[derive(Debug, Deserialize)]
pub struct UnifiedTiers {
    pub tiers: Vec<RefundTier>,
}

/// One indexed chain
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub subgraph_url: String,
    /// MerkleRedeem contract holding the claimable distributions
    pub merkle_redeem: Address,
    pub chain_currency_coingecko_id: String,
    /// Contract keys indexed on this chain
    #[serde(default)]
    pub contracts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub coingecko_key: String,
    pub token_coingecko_id: String,
    pub stakes_api_url: String,
    /// JSON index mapping each published epoch to its distribution file
    #[serde(default)]
    pub distributions_index_url: Option<String>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| {
            "Failed to parse config.toml. Check for:\n\
             - Missing required sections ([api], [[chains]])\n\
             - Amounts written as numbers instead of quoted strings\n\
             - Unknown stake algorithm names\n\n\
             See config.toml.example for the expected format."
        })
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Validated configuration, built once at startup
#[derive(Debug)]
pub struct Config {
    pub genesis_epoch: u64,
    pub unified_chain_id: u64,
    pub slice_duration_secs: i64,
    pub virtual_lockup_secs: i64,
    pub missing_stake_policy: MissingStakePolicy,
    pub concurrency: usize,
    pub contract_concurrency: usize,
    pub fetch_timeout: Duration,
    pub migration_contract_key: String,
    pub balance_cache_ttl: Duration,
    pub budget: BudgetLimits,
    pub rules: EpochRules,
    pub chains: Vec<ChainConfig>,
    pub coingecko_api_key: String,
    pub token_coingecko_id: String,
    pub stakes_api_url: String,
    pub distributions_index_url: Option<String>,
}

impl Config {
    pub fn from_file(file_config: &FileConfig) -> Result<Self> {
        let program = &file_config.program;

        if program.slice_duration_secs <= 0 {
            bail!("program.slice_duration_secs must be positive");
        }
        if program.virtual_lockup_secs < 0 {
            bail!("program.virtual_lockup_secs must not be negative");
        }
        if program.concurrency == 0 {
            bail!("program.concurrency must be at least 1");
        }
        if program.contract_concurrency == 0 {
            bail!("program.contract_concurrency must be at least 1");
        }

        let budget = BudgetLimits {
            max_token_global: file_config
                .budget
                .max_token_global
                .unwrap_or_else(|| whole_tokens(constants::DEFAULT_MAX_TOKEN_GLOBAL)),
            max_usd_per_account: file_config
                .budget
                .max_usd_per_account
                .unwrap_or_else(|| Decimal::from(constants::DEFAULT_MAX_USD_PER_ACCOUNT)),
        };
        if budget.max_token_global <= Decimal::ZERO || budget.max_usd_per_account <= Decimal::ZERO {
            bail!("budget caps must be positive");
        }

        let mut seen = HashSet::new();
        for chain in &file_config.chains {
            if !seen.insert(chain.chain_id) {
                bail!("chain {} is configured twice", chain.chain_id);
            }
        }

        Ok(Self {
            genesis_epoch: program.genesis_epoch,
            unified_chain_id: program.unified_chain_id,
            slice_duration_secs: program.slice_duration_secs,
            virtual_lockup_secs: program.virtual_lockup_secs,
            missing_stake_policy: program.missing_stake_policy,
            concurrency: program.concurrency,
            contract_concurrency: program.contract_concurrency,
            fetch_timeout: Duration::from_secs(program.fetch_timeout_secs),
            migration_contract_key: program.migration_contract_key.clone(),
            balance_cache_ttl: Duration::from_secs(program.balance_cache_ttl_secs),
            budget,
            rules: build_rules(file_config)?,
            chains: file_config.chains.clone(),
            coingecko_api_key: file_config.api.coingecko_key.clone(),
            token_coingecko_id: file_config.api.token_coingecko_id.clone(),
            stakes_api_url: file_config.api.stakes_api_url.clone(),
            distributions_index_url: file_config.api.distributions_index_url.clone(),
        })
    }

    pub fn chain(&self, chain_id: u64) -> Result<&ChainConfig> {
        self.chains
            .iter()
            .find(|c| c.chain_id == chain_id)
            .with_context(|| format!("chain {} is not configured", chain_id))
    }

    pub fn contracts_by_chain(&self) -> HashMap<u64, Vec<String>> {
        self.chains
            .iter()
            .map(|c| (c.chain_id, c.contracts.clone()))
            .collect()
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            virtual_lockup_secs: self.virtual_lockup_secs,
            unified_chain_id: self.unified_chain_id,
            missing_policy: self.missing_stake_policy,
        }
    }

    pub fn indexer_settings(&self) -> IndexerSettings {
        IndexerSettings {
            slice_duration_secs: self.slice_duration_secs,
            contract_concurrency: self.contract_concurrency,
            lookup_concurrency: self.concurrency,
            fetch_timeout: self.fetch_timeout,
            migration_contract_key: self.migration_contract_key.clone(),
        }
    }

    pub fn accumulator_settings(&self) -> AccumulatorSettings {
        AccumulatorSettings {
            slice_duration_secs: self.slice_duration_secs,
            concurrency: self.concurrency,
            fetch_timeout: self.fetch_timeout,
            unified_chain_id: self.unified_chain_id,
            missing_policy: self.missing_stake_policy,
        }
    }
}

/// Epoch rules from the config tables, built-in defaults for omitted tables
fn build_rules(file_config: &FileConfig) -> Result<EpochRules> {
    let defaults = EpochRules::default();

    let algorithms = if file_config.stake_algorithms.is_empty() {
        defaults.algorithms
    } else {
        EpochTable::new(
            file_config
                .stake_algorithms
                .iter()
                .map(|row| (row.from_epoch, row.algorithm))
                .collect(),
        )
        .context("Invalid [[stake_algorithms]]")?
    };

    let min_stake = if file_config.min_stake.is_empty() {
        defaults.min_stake
    } else {
        EpochTable::new(
            file_config
                .min_stake
                .iter()
                .map(|row| (row.from_epoch, row.amount))
                .collect(),
        )
        .context("Invalid [[min_stake]]")?
    };

    let refund_tiers = if file_config.refund_tiers.is_empty() {
        defaults.refund_tiers
    } else {
        let rows = file_config
            .refund_tiers
            .iter()
            .map(|row| {
                RefundTiers::new(row.tiers.clone())
                    .map(|tiers| (row.from_epoch, tiers))
                    .with_context(|| format!("Invalid refund tiers from epoch {}", row.from_epoch))
            })
            .collect::<Result<Vec<_>>>()?;
        EpochTable::new(rows).context("Invalid [[refund_tiers]]")?
    };

    let unified_tiers = match &file_config.unified_tiers {
        Some(unified) => RefundTiers::new(unified.tiers.clone()).context("Invalid [unified_tiers]")?,
        None => defaults.unified_tiers,
    };

    Ok(EpochRules {
        algorithms,
        min_stake,
        refund_tiers,
        unified_tiers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [api]
        coingecko_key = "demo"
        token_coingecko_id = "protocol-token"
        stakes_api_url = "http://localhost:8080"

        [[chains]]
        chain_id = 1
        rpc_url = "http://localhost:8545"
        subgraph_url = "http://localhost:8000/subgraphs/name/swaps"
        merkle_redeem = "0xFEB7e2D8584BEf7BB21dA0B70C148DABf1388031"
        chain_currency_coingecko_id = "ethereum"
        contracts = ["augustus", "migration-100-percent"]
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_file(&FileConfig::parse(MINIMAL).unwrap()).unwrap();

        assert_eq!(config.genesis_epoch, constants::GENESIS_EPOCH);
        assert_eq!(config.slice_duration_secs, constants::DEFAULT_SLICE_DURATION_SEC);
        assert_eq!(config.missing_stake_policy, MissingStakePolicy::Zero);
        assert_eq!(config.contract_concurrency, constants::DEFAULT_CONTRACT_CONCURRENCY);
        assert_eq!(
            config.budget.max_token_global,
            whole_tokens(constants::DEFAULT_MAX_TOKEN_GLOBAL)
        );
        assert_eq!(config.budget.max_usd_per_account, Decimal::from(30_000));
        assert_eq!(config.rules.algorithm(32).unwrap(), StakeAlgorithm::Unified);
        assert_eq!(config.contracts_by_chain()[&1].len(), 2);
        assert!(config.chain(1).is_ok());
        assert!(config.chain(56).is_err());
        assert!(config.distributions_index_url.is_none());
    }

    #[test]
    fn test_tables_override_defaults() {
        let toml = format!(
            r#"
            [program]
            missing_stake_policy = "abort"
            concurrency = 2
            contract_concurrency = 3

            [budget]
            max_token_global = "1000000000000000000000"
            max_usd_per_account = "50"

            [[stake_algorithms]]
            from_epoch = 1
            algorithm = "exact_timestamp"

            [[stake_algorithms]]
            from_epoch = 5
            algorithm = "unified"

            [[min_stake]]
            from_epoch = 1
            amount = "100"

            [[refund_tiers]]
            from_epoch = 1
            tiers = [{{ min_stake = "100", percent = "0.5" }}, {{ min_stake = "1000", percent = "1" }}]

            [unified_tiers]
            tiers = [{{ min_stake = "1", percent = "0.1" }}]
            {MINIMAL}
            "#
        );
        let config = Config::from_file(&FileConfig::parse(&toml).unwrap()).unwrap();

        assert_eq!(config.missing_stake_policy, MissingStakePolicy::Abort);
        let indexer = config.indexer_settings();
        assert_eq!(indexer.contract_concurrency, 3);
        assert_eq!(indexer.lookup_concurrency, 2);
        assert_eq!(config.budget.max_usd_per_account, Decimal::from(50));
        assert_eq!(config.rules.algorithm(4).unwrap(), StakeAlgorithm::ExactTimestamp);
        assert_eq!(config.rules.algorithm(5).unwrap(), StakeAlgorithm::Unified);
        assert_eq!(config.rules.min_stake(3).unwrap(), Decimal::from(100));
        assert_eq!(config.rules.refund_percent(3, Decimal::from(999)), Some("0.5".parse().unwrap()));
        assert_eq!(config.rules.unified_refund_percent(Decimal::from(5)), Some("0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_tables_rejected() {
        let unsorted = format!(
            r#"
            [[stake_algorithms]]
            from_epoch = 12
            algorithm = "exact_timestamp"

            [[stake_algorithms]]
            from_epoch = 9
            algorithm = "legacy_same_day"
            {MINIMAL}
            "#
        );
        assert!(Config::from_file(&FileConfig::parse(&unsorted).unwrap()).is_err());

        let decreasing = format!(
            r#"
            [[refund_tiers]]
            from_epoch = 9
            tiers = [{{ min_stake = "1", percent = "0.5" }}, {{ min_stake = "2", percent = "0.25" }}]
            {MINIMAL}
            "#
        );
        assert!(Config::from_file(&FileConfig::parse(&decreasing).unwrap()).is_err());

        let zero_slice = format!("[program]\nslice_duration_secs = 0\n{MINIMAL}");
        assert!(Config::from_file(&FileConfig::parse(&zero_slice).unwrap()).is_err());

        let no_contracts = format!("[program]\ncontract_concurrency = 0\n{MINIMAL}");
        assert!(Config::from_file(&FileConfig::parse(&no_contracts).unwrap()).is_err());
    }

    #[test]
    fn test_unknown_algorithm_fails_to_parse() {
        let toml = format!("[[stake_algorithms]]\nfrom_epoch = 9\nalgorithm = \"bogus\"\n{MINIMAL}");
        assert!(FileConfig::parse(&toml).is_err());
    }
}
