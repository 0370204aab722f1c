//! Daily price rates: resolution by timestamp and CoinGecko fetching

use anyhow::{Context, Result, anyhow};
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::constants;
use crate::http::fetch_json;
use crate::store::Store;
use crate::time::utc_date;
use crate::types::PriceRate;

/// USD price per UTC day for one coin
pub type DailyUsdPrices = BTreeMap<NaiveDate, Decimal>;

/// Rate lookup for a transaction timestamp; `None` means no rate that day
pub trait PriceResolver: Send + Sync {
    fn resolve(&self, timestamp: i64) -> Option<PriceRate>;
}

/// Same-day rates keyed by UTC date
#[derive(Debug, Clone, Default)]
pub struct DailyPriceResolver {
    rates: BTreeMap<NaiveDate, PriceRate>,
}

impl DailyPriceResolver {
    pub fn new(rates: BTreeMap<NaiveDate, PriceRate>) -> Self {
        Self { rates }
    }

    pub fn insert(&mut self, date: NaiveDate, rate: PriceRate) {
        self.rates.insert(date, rate);
    }

    pub fn rates(&self) -> &BTreeMap<NaiveDate, PriceRate> {
        &self.rates
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Days in `[from, to]` without a rate
    pub fn missing_days(&self, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        from.iter_days()
            .take_while(|day| *day <= to)
            .filter(|day| !self.rates.contains_key(day))
            .collect()
    }
}

impl PriceResolver for DailyPriceResolver {
    fn resolve(&self, timestamp: i64) -> Option<PriceRate> {
        self.rates.get(&utc_date(timestamp)?).copied()
    }
}

/// Pair token and chain-currency prices of the same day into rates
pub fn combine_daily_rates(
    token: &DailyUsdPrices,
    chain_currency: &DailyUsdPrices,
) -> BTreeMap<NaiveDate, PriceRate> {
    token
        .iter()
        .filter_map(|(day, token_usd)| {
            let chain_usd = chain_currency.get(day)?;
            PriceRate::from_usd_prices(*token_usd, *chain_usd).map(|rate| (*day, rate))
        })
        .collect()
}

// =============================================================================
// CoinGecko
// =============================================================================

/// CoinGecko market chart response
#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    prices: Vec<[f64; 2]>, // [timestamp_ms, price]
}

pub struct CoinGeckoClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl CoinGeckoClient {
    pub fn new(client: reqwest::Client, api_key: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: constants::COINGECKO_API_BASE.to_string(),
        }
    }

    /// Daily USD prices for `[from, to]`, keeping the last quote of each day
    pub async fn daily_usd_prices(
        &self,
        coin_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DailyUsdPrices> {
        let from_ts = from.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        // One day past `to` so its quotes are included
        let to_ts = to
            .checked_add_days(Days::new(1))
            .ok_or_else(|| anyhow!("date out of range: {}", to))?
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
            .timestamp();

        let url = format!("{}/coins/{}/market_chart/range", self.base_url, coin_id);
        let response: Option<MarketChartResponse> = fetch_json(|| {
            self.client
                .get(&url)
                .header("x-cg-demo-api-key", &self.api_key)
                .query(&[("vs_currency", "usd")])
                .query(&[("from", from_ts), ("to", to_ts)])
        })
        .await
        .with_context(|| format!("Failed to fetch {} prices from CoinGecko", coin_id))?;

        let data = response.ok_or_else(|| anyhow!("CoinGecko has no coin named {}", coin_id))?;
        Ok(daily_closes(&data.prices, from, to))
    }
}

fn daily_closes(points: &[[f64; 2]], from: NaiveDate, to: NaiveDate) -> DailyUsdPrices {
    let mut daily = DailyUsdPrices::new();
    for [timestamp_ms, price] in points {
        let Some(day) = utc_date(*timestamp_ms as i64 / 1000) else {
            continue;
        };
        if day < from || day > to {
            continue;
        }
        // Later quotes of the same day overwrite earlier ones (close price)
        if let Some(price) = Decimal::from_f64(*price) {
            daily.insert(day, price);
        }
    }
    daily
}

/// Load cached rates for `[from, to]`, fetching only the missing days
pub async fn load_daily_rates(
    store: &Store,
    coingecko: &CoinGeckoClient,
    chain_id: u64,
    token_coin_id: &str,
    chain_currency_coin_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<DailyPriceResolver> {
    let mut resolver = DailyPriceResolver::new(store.get_prices(chain_id).await?);
    let missing = resolver.missing_days(from, to);

    let (Some(first), Some(last)) = (missing.first(), missing.last()) else {
        info!(chain_id, days = resolver.len(), "all daily rates cached");
        return Ok(resolver);
    };

    info!(chain_id, from = %first, to = %last, missing = missing.len(), "fetching daily rates");
    let token = coingecko.daily_usd_prices(token_coin_id, *first, *last).await?;
    let chain_currency = coingecko
        .daily_usd_prices(chain_currency_coin_id, *first, *last)
        .await?;

    let fetched = combine_daily_rates(&token, &chain_currency);
    store.store_prices(chain_id, &fetched).await?;
    for (day, rate) in fetched {
        resolver.insert(day, rate);
    }

    let still_missing = resolver.missing_days(from, to);
    if !still_missing.is_empty() {
        warn!(
            chain_id,
            days = still_missing.len(),
            first = %still_missing[0],
            "no rate available for some days; their transactions will fail"
        );
    }
    Ok(resolver)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_resolve_uses_utc_day() {
        let rate = PriceRate::from_usd_prices(dec("0.1"), dec("2000")).unwrap();
        let mut resolver = DailyPriceResolver::default();
        resolver.insert(day(2024, 1, 10), rate);

        // 2024-01-10 00:00:00 and 23:59:59 UTC
        assert_eq!(resolver.resolve(1_704_844_800), Some(rate));
        assert_eq!(resolver.resolve(1_704_931_199), Some(rate));
        assert_eq!(resolver.resolve(1_704_931_200), None);
    }

    #[test]
    fn test_missing_days_inclusive_range() {
        let rate = PriceRate::from_usd_prices(dec("1"), dec("1")).unwrap();
        let mut resolver = DailyPriceResolver::default();
        resolver.insert(day(2024, 1, 2), rate);

        assert_eq!(
            resolver.missing_days(day(2024, 1, 1), day(2024, 1, 3)),
            vec![day(2024, 1, 1), day(2024, 1, 3)]
        );
    }

    #[test]
    fn test_combine_requires_both_prices() {
        let token: DailyUsdPrices = [(day(2024, 1, 1), dec("0.5")), (day(2024, 1, 2), dec("0.6"))].into();
        let chain: DailyUsdPrices = [(day(2024, 1, 2), dec("3000"))].into();

        let rates = combine_daily_rates(&token, &chain);
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[&day(2024, 1, 2)].token_per_chain_currency, dec("0.0002"));
    }

    #[test]
    fn test_daily_closes_keep_last_quote() {
        // 2024-01-01 00:00, 12:00 and 2024-01-02 00:00 UTC, in milliseconds
        let points = [
            [1_704_067_200_000.0, 1.0],
            [1_704_110_400_000.0, 1.5],
            [1_704_153_600_000.0, 2.0],
        ];
        let closes = daily_closes(&points, day(2024, 1, 1), day(2024, 1, 1));
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[&day(2024, 1, 1)], dec("1.5"));
    }
}
