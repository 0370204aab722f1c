//! Transaction and swap sources: subgraph queries plus JSON-RPC receipts

use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::ChainConfig;
use crate::constants::SUBGRAPH_PAGE_SIZE;
use crate::http::fetch_json;
use crate::types::{RefundableTransaction, SwapTransaction};

/// Transactions against one monitored contract in `[start, end)`
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn transactions(
        &self,
        chain_id: u64,
        contract: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RefundableTransaction>>;
}

/// Successful swaps in `[start, end)` and their gas usage
#[async_trait]
pub trait SwapSource: Send + Sync {
    async fn successful_swaps(&self, chain_id: u64, start: i64, end: i64) -> Result<Vec<SwapTransaction>>;

    async fn gas_used(&self, chain_id: u64, hash: B256) -> Result<u64>;
}

// =============================================================================
// GraphQL Plumbing
// =============================================================================

const TRANSACTIONS_QUERY: &str = r#"
query ($contract: String!, $from: BigInt!, $to: BigInt!, $first: Int!) {
  transactions(
    first: $first
    orderBy: timestamp
    orderDirection: asc
    where: { contract: $contract, timestamp_gte: $from, timestamp_lt: $to }
  ) {
    txHash
    blockNumber
    timestamp
    txOrigin
    txGasUsed
    txGasPrice
  }
}
"#;

const SWAPS_QUERY: &str = r#"
query ($from: BigInt!, $to: BigInt!, $first: Int!) {
  swaps(
    first: $first
    orderBy: timestamp
    orderDirection: asc
    where: { timestamp_gte: $from, timestamp_lt: $to }
  ) {
    txHash
    blockNumber
    timestamp
    txOrigin
    txGasPrice
  }
}
"#;

#[derive(Serialize)]
struct GraphRequest<'a, V> {
    query: &'a str,
    variables: V,
}

#[derive(Deserialize)]
struct GraphResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphError>>,
}

#[derive(Deserialize)]
struct GraphError {
    message: String,
}

#[derive(Serialize)]
struct TransactionsVariables<'a> {
    contract: &'a str,
    from: String,
    to: String,
    first: usize,
}

#[derive(Serialize)]
struct SwapsVariables {
    from: String,
    to: String,
    first: usize,
}

#[derive(Deserialize)]
struct TransactionsData {
    transactions: Vec<RawTransaction>,
}

#[derive(Deserialize)]
struct SwapsData {
    swaps: Vec<RawSwap>,
}

/// Subgraph entities carry BigInts as strings
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    tx_hash: B256,
    block_number: String,
    timestamp: String,
    tx_origin: Address,
    tx_gas_used: String,
    tx_gas_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSwap {
    tx_hash: B256,
    block_number: String,
    timestamp: String,
    tx_origin: Address,
    tx_gas_price: String,
}

fn parse_num<T: std::str::FromStr>(field: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow!("invalid {} {:?}: {}", field, value, e))
}

impl RawTransaction {
    fn parse(self, contract: &str) -> Result<RefundableTransaction> {
        Ok(RefundableTransaction {
            hash: self.tx_hash,
            block_number: parse_num("blockNumber", &self.block_number)?,
            timestamp: parse_num("timestamp", &self.timestamp)?,
            tx_origin: self.tx_origin,
            gas_used: parse_num("txGasUsed", &self.tx_gas_used)?,
            gas_price: parse_num("txGasPrice", &self.tx_gas_price)?,
            contract: contract.to_string(),
        })
    }
}

impl RawSwap {
    fn parse(self) -> Result<SwapTransaction> {
        Ok(SwapTransaction {
            hash: self.tx_hash,
            block_number: parse_num("blockNumber", &self.block_number)?,
            timestamp: parse_num("timestamp", &self.timestamp)?,
            tx_origin: self.tx_origin,
            gas_price: parse_num("txGasPrice", &self.tx_gas_price)?,
        })
    }
}

/// Keyset pagination on `timestamp`: the next page starts at the last
/// timestamp seen, duplicates at the boundary are dropped by hash.
async fn paginate<T, F, Fut>(start: i64, mut fetch_page: F) -> Result<Vec<T>>
where
    T: HasPageKey,
    F: FnMut(i64) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<T>>>,
{
    let mut cursor = start;
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    loop {
        let page = fetch_page(cursor).await?;
        let full = page.len() >= SUBGRAPH_PAGE_SIZE;
        let last_timestamp = page.last().map(HasPageKey::timestamp);

        for item in page {
            if seen.insert(item.hash()) {
                items.push(item);
            }
        }

        match last_timestamp {
            Some(last) if full => {
                if last == cursor {
                    bail!(
                        "more than {} entries share timestamp {}",
                        SUBGRAPH_PAGE_SIZE,
                        cursor
                    );
                }
                cursor = last;
            }
            _ => break,
        }
    }

    Ok(items)
}

trait HasPageKey {
    fn timestamp(&self) -> i64;
    fn hash(&self) -> B256;
}

impl HasPageKey for RefundableTransaction {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
    fn hash(&self) -> B256 {
        self.hash
    }
}

impl HasPageKey for SwapTransaction {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
    fn hash(&self) -> B256 {
        self.hash
    }
}

// =============================================================================
// Subgraph + RPC Source
// =============================================================================

struct ChainEndpoint {
    subgraph_url: String,
    provider: DynProvider,
}

/// Per-chain subgraph for transaction history, RPC node for receipts
pub struct SubgraphSource {
    client: reqwest::Client,
    chains: HashMap<u64, ChainEndpoint>,
}

impl SubgraphSource {
    pub fn new(client: reqwest::Client, chains: &[ChainConfig]) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for chain in chains {
            let rpc_url = chain
                .rpc_url
                .parse()
                .with_context(|| format!("Invalid rpc_url for chain {}", chain.chain_id))?;
            let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
            endpoints.insert(
                chain.chain_id,
                ChainEndpoint {
                    subgraph_url: chain.subgraph_url.clone(),
                    provider,
                },
            );
        }
        Ok(Self {
            client,
            chains: endpoints,
        })
    }

    fn endpoint(&self, chain_id: u64) -> Result<&ChainEndpoint> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| anyhow!("chain {} is not configured", chain_id))
    }

    async fn query<V: Serialize, D: DeserializeOwned>(&self, url: &str, query: &str, variables: V) -> Result<D> {
        let body = GraphRequest { query, variables };
        let response: Option<GraphResponse<D>> =
            fetch_json(|| self.client.post(url).json(&body)).await?;
        let response = response.ok_or_else(|| anyhow!("subgraph not found at {}", url))?;

        if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            bail!("subgraph errors: {}", messages.join("; "));
        }
        response.data.ok_or_else(|| anyhow!("subgraph returned no data"))
    }
}

#[async_trait]
impl TransactionSource for SubgraphSource {
    async fn transactions(
        &self,
        chain_id: u64,
        contract: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RefundableTransaction>> {
        let endpoint = self.endpoint(chain_id)?;
        paginate(start, |cursor| async move {
            let data: TransactionsData = self
                .query(
                    &endpoint.subgraph_url,
                    TRANSACTIONS_QUERY,
                    TransactionsVariables {
                        contract,
                        from: cursor.to_string(),
                        to: end.to_string(),
                        first: SUBGRAPH_PAGE_SIZE,
                    },
                )
                .await?;
            data.transactions
                .into_iter()
                .map(|raw| raw.parse(contract))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .with_context(|| format!("Failed to fetch {} transactions on chain {}", contract, chain_id))
    }
}

#[async_trait]
impl SwapSource for SubgraphSource {
    async fn successful_swaps(&self, chain_id: u64, start: i64, end: i64) -> Result<Vec<SwapTransaction>> {
        let endpoint = self.endpoint(chain_id)?;
        paginate(start, |cursor| async move {
            let data: SwapsData = self
                .query(
                    &endpoint.subgraph_url,
                    SWAPS_QUERY,
                    SwapsVariables {
                        from: cursor.to_string(),
                        to: end.to_string(),
                        first: SUBGRAPH_PAGE_SIZE,
                    },
                )
                .await?;
            data.swaps
                .into_iter()
                .map(RawSwap::parse)
                .collect::<Result<Vec<_>>>()
        })
        .await
        .with_context(|| format!("Failed to fetch swaps on chain {}", chain_id))
    }

    async fn gas_used(&self, chain_id: u64, hash: B256) -> Result<u64> {
        let endpoint = self.endpoint(chain_id)?;
        let receipt = endpoint
            .provider
            .get_transaction_receipt(hash)
            .await
            .with_context(|| format!("Failed to fetch receipt of {}", hash))?
            .ok_or_else(|| anyhow!("no receipt for {} on chain {}", hash, chain_id))?;
        Ok(receipt.gas_used)
    }
}
