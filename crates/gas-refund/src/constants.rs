//! Centralized constants for the gas refund program
//!
//! Values that operators tune per deployment live in config.toml.
//! Everything here is either protocol-fixed or a default for a config key.

// =============================================================================
// Time
// =============================================================================

pub const ONE_HOUR_SEC: i64 = 3_600;

pub const ONE_DAY_SEC: i64 = 24 * ONE_HOUR_SEC;

/// Default indexing window. Empirically sized: large enough to keep the
/// number of subgraph round-trips low, small enough to keep a window's
/// transactions and stake snapshots in memory.
pub const DEFAULT_SLICE_DURATION_SEC: i64 = 6 * ONE_HOUR_SEC;

/// Default virtual lockup window (7 days)
pub const DEFAULT_VIRTUAL_LOCKUP_SEC: i64 = 7 * ONE_DAY_SEC;

// =============================================================================
// Token Units
// =============================================================================

/// Protocol token and chain currencies are all encoded with 18 decimals
pub const TOKEN_DECIMALS: u32 = 18;

// =============================================================================
// Default Epoch Thresholds
// First epoch at which each stake algorithm applies
// =============================================================================

pub const GENESIS_EPOCH: u64 = 9;

pub const STAKES_ALGO_FLIP_EPOCH: u64 = 11;

pub const SAFETY_MODULE_START_EPOCH: u64 = 12;

pub const VIRTUAL_LOCKUP_START_EPOCH: u64 = 14;

pub const SAFETY_MODULE_FULL_BPT_FIX_EPOCH: u64 = 20;

pub const UNIFIED_STAKES_EPOCH: u64 = 32;

// =============================================================================
// Defaults for Budgets and Processing
// =============================================================================

/// Default process-wide token budget in whole tokens (scaled to base units at load)
pub const DEFAULT_MAX_TOKEN_GLOBAL: u64 = 30_000_000;

/// Default per-account USD budget
pub const DEFAULT_MAX_USD_PER_ACCOUNT: u64 = 30_000;

/// Default bound on concurrent external fetches
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default number of contracts indexed at the same time
pub const DEFAULT_CONTRACT_CONCURRENCY: usize = 2;

/// Default timeout for a single external fetch
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Contract key of the migration incentive pool, always refunded at 100%
pub const MIGRATION_100_PERCENT_KEY: &str = "migration-100-percent";

// =============================================================================
// API Endpoints
// =============================================================================

/// CoinGecko API base URL
pub const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";

/// Page size used when paginating subgraph queries
pub const SUBGRAPH_PAGE_SIZE: usize = 1_000;

/// Maximum attempts for a retried HTTP request
pub const MAX_HTTP_RETRIES: u32 = 3;

/// How long a fetched distribution index is trusted before refetching
pub const DISTRIBUTION_INDEX_TTL_SECS: u64 = 5 * 60;

/// Tree files fetched at the same time when the index changes
pub const DISTRIBUTION_FETCH_CONCURRENCY: usize = 4;

// =============================================================================
// File Names
// =============================================================================

/// Refund database filename
pub const DATABASE_FILENAME: &str = "refunds.sqlite";

/// Default config file path
pub const CONFIG_FILENAME: &str = "config.toml";
