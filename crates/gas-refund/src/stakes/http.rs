//! Stake source backed by the stakes API
//!
//! Endpoints (all `GET`, 404 meaning "no data for that timestamp"):
//! - `/snapshot?pool=&timestamp=` -> `{ "balances": { "0x..": "123" } }`
//! - `/balance?pool=&address=&timestamp=` -> `{ "balance": "123" }`
//! - `/bpt-state?timestamp=` -> `{ "bptTotalSupply", "tokenReserve", "tokenWeight" }`

use alloy::primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::{BptPoolState, StakePool, StakeSnapshot, StakeSource};
use crate::http::fetch_json;

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    balances: HashMap<Address, Decimal>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BptStateResponse {
    bpt_total_supply: Decimal,
    token_reserve: Decimal,
    token_weight: Decimal,
}

pub struct HttpStakeSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStakeSource {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StakeSource for HttpStakeSource {
    async fn snapshot(&self, pool: StakePool, timestamp: i64) -> Result<Option<Arc<StakeSnapshot>>> {
        let url = format!("{}/snapshot", self.base_url);
        let pool_param = pool.to_string();
        let response: Option<SnapshotResponse> = fetch_json(|| {
            self.client
                .get(&url)
                .query(&[("pool", pool_param.as_str())])
                .query(&[("timestamp", timestamp)])
        })
        .await
        .with_context(|| format!("Failed to fetch {} snapshot at {}", pool, timestamp))?;

        Ok(response.map(|r| Arc::new(r.balances)))
    }

    async fn balance(&self, pool: StakePool, address: Address, timestamp: i64) -> Result<Option<Decimal>> {
        let url = format!("{}/balance", self.base_url);
        let pool_param = pool.to_string();
        let address_param = address.to_string();
        let response: Option<BalanceResponse> = fetch_json(|| {
            self.client
                .get(&url)
                .query(&[("pool", pool_param.as_str()), ("address", address_param.as_str())])
                .query(&[("timestamp", timestamp)])
        })
        .await
        .with_context(|| format!("Failed to fetch {} balance of {} at {}", pool, address, timestamp))?;

        Ok(response.map(|r| r.balance))
    }

    async fn bpt_pool_state(&self, timestamp: i64) -> Result<Option<BptPoolState>> {
        let url = format!("{}/bpt-state", self.base_url);
        let response: Option<BptStateResponse> =
            fetch_json(|| self.client.get(&url).query(&[("timestamp", timestamp)]))
                .await
                .with_context(|| format!("Failed to fetch BPT pool state at {}", timestamp))?;

        Ok(response.map(|r| BptPoolState {
            bpt_total_supply: r.bpt_total_supply,
            token_reserve: r.token_reserve,
            token_weight: r.token_weight,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_response_parses_string_balances() {
        let body = r#"{"balances":{"0x0000000000000000000000000000000000000001":"1500000000000000000000"}}"#;
        let parsed: SnapshotResponse = serde_json::from_str(body).unwrap();
        let a = Address::with_last_byte(1);
        assert_eq!(
            parsed.balances.get(&a).copied(),
            Some("1500000000000000000000".parse().unwrap())
        );
    }

    #[test]
    fn test_bpt_state_response_is_camel_case() {
        let body = r#"{"bptTotalSupply":"100","tokenReserve":"800","tokenWeight":"0.8"}"#;
        let parsed: BptStateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.token_weight, "0.8".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let source = HttpStakeSource::new(reqwest::Client::new(), "https://stakes.example/api/");
        assert_eq!(source.base_url, "https://stakes.example/api");
    }
}
