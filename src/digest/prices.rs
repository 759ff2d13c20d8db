//! Spot price snapshot for digests (CoinGecko simple price).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::ingest::fetch_text;
use crate::ingest::types::FetchError;
use crate::store::PriceQuote;

const COINGECKO_BASE: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko id and display symbol, in display order.
pub const TRACKED_COINS: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("ethereum", "ETH"),
    ("solana", "SOL"),
    ("hyperliquid", "HYPE"),
];

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(&self) -> Result<Vec<PriceQuote>, FetchError>;
}

pub struct CoinGeckoPrices {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CoinGeckoPrices {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: COINGECKO_BASE.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }
}

/// Quotes for every tracked coin present in a `simple/price` body. Coins without a USD price
/// are left out.
pub fn parse_simple_price(body: &Value) -> Vec<PriceQuote> {
    TRACKED_COINS
        .iter()
        .filter_map(|(id, symbol)| {
            let coin = body.get(*id)?;
            Some(PriceQuote {
                symbol: symbol.to_string(),
                usd: coin.get("usd")?.as_f64()?,
                change_24h_pct: coin.get("usd_24h_change").and_then(Value::as_f64),
            })
        })
        .collect()
}

#[async_trait]
impl PriceSource for CoinGeckoPrices {
    async fn fetch_prices(&self) -> Result<Vec<PriceQuote>, FetchError> {
        let ids: Vec<&str> = TRACKED_COINS.iter().map(|(id, _)| *id).collect();
        let url = url::Url::parse_with_params(
            &format!("{}/simple/price", self.base_url),
            &[
                ("ids", ids.join(",").as_str()),
                ("vs_currencies", "usd"),
                ("include_24hr_change", "true"),
            ],
        )
        .map_err(|e| FetchError::parse(&self.base_url, e.to_string()))?;

        let body = fetch_text(&self.http, url.as_str(), self.timeout, "application/json").await?;
        let value: Value = serde_json::from_str(&body).map_err(|e| FetchError::parse(url.as_str(), e.to_string()))?;
        Ok(parse_simple_price(&value))
    }
}

pub fn format_price(price: f64) -> String {
    if price >= 1000.0 {
        let whole = price.round() as i64;
        let digits = whole.abs().to_string();
        let mut grouped = String::new();
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }
        format!("${grouped}")
    } else if price >= 1.0 {
        format!("${price:.2}")
    } else {
        format!("${price:.4}")
    }
}

pub fn format_change(change: f64) -> String {
    let sign = if change >= 0.0 { "+" } else { "" };
    format!("{sign}{change:.2}%")
}
