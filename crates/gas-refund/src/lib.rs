//! Gas fee refunds for token stakers
//!
//! Computes, per address and epoch, a refund of gas fees paid on monitored
//! contracts, denominated in the protocol token and scaled by the address's
//! stake. Refunds are capped by a global token budget and a per-account USD
//! budget, and finalized epochs are exposed as Merkle-provable claims.

pub mod budget;
pub mod claims;
pub mod config;
pub mod constants;
pub mod distributions;
pub mod epochs;
pub mod error;
pub mod http;
pub mod indexer;
pub mod prices;
pub mod reports;
pub mod sources;
pub mod stakes;
pub mod store;
pub mod swaps;
pub mod time;
pub mod ttl_cache;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
