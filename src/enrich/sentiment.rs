//! External sentiment providers and the multi-source aggregation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::ingest::types::FetchError;
use crate::ratelimit::RateLimiter;
use crate::store::Sentiment;

const FINNHUB_BASE: &str = "https://finnhub.io/api/v1";
const FMP_BASE: &str = "https://financialmodelingprep.com/api/v4";

/// One provider's reading for a ticker, normalized to `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSentiment {
    pub provider: String,
    pub symbol: String,
    pub score: f64,
}

#[async_trait]
pub trait SentimentProvider: Send + Sync {
    fn name(&self) -> &str;
    /// `Ok(None)` when the provider is unconfigured, throttled or has no data.
    async fn fetch_sentiment(&self, symbol: &str) -> Result<Option<ProviderSentiment>, FetchError>;
}

async fn get_json(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<Option<Value>, FetchError> {
    let rsp = client
        .get(url)
        .timeout(timeout)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;
    let status = rsp.status();
    if status.as_u16() == 429 {
        tracing::warn!(url, "sentiment provider rate limit exceeded");
        return Ok(None);
    }
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = rsp
        .text()
        .await
        .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| FetchError::parse(url, e.to_string()))
}

/// Number or numeric string.
fn lenient_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Finnhub news sentiment. Free tier allows 60 calls/minute.
pub struct FinnhubProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    limiter: RateLimiter,
    timeout: Duration,
}

impl FinnhubProvider {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: FINNHUB_BASE.to_string(),
            limiter: RateLimiter::new(60.0, 1.0),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }
}

/// `(bullish - bearish) / (bullish + bearish)`, or 0 with no signal.
pub fn finnhub_score(body: &Value) -> Option<f64> {
    let s = body.get("sentiment")?;
    let bullish = s.get("bullishPercent").or_else(|| s.get("bullish")).and_then(lenient_f64).unwrap_or(0.0);
    let bearish = s.get("bearishPercent").or_else(|| s.get("bearish")).and_then(lenient_f64).unwrap_or(0.0);
    let total = bullish + bearish;
    Some(if total > 0.0 { (bullish - bearish) / total } else { 0.0 })
}

#[async_trait]
impl SentimentProvider for FinnhubProvider {
    fn name(&self) -> &str {
        "finnhub"
    }

    async fn fetch_sentiment(&self, symbol: &str) -> Result<Option<ProviderSentiment>, FetchError> {
        let Some(key) = self.api_key.as_deref() else {
            tracing::debug!(provider = "finnhub", "API key not configured, skipping");
            return Ok(None);
        };
        self.limiter.acquire(1.0).await;

        let endpoint = format!("{}/news-sentiment", self.base_url);
        let url = url::Url::parse_with_params(&endpoint, &[("symbol", format!("CRYPTO:{symbol}").as_str()), ("token", key)])
            .map_err(|e| FetchError::parse(&endpoint, e.to_string()))?;
        let Some(body) = get_json(&self.http, url.as_str(), self.timeout).await? else {
            return Ok(None);
        };
        Ok(finnhub_score(&body).map(|score| ProviderSentiment {
            provider: "finnhub".into(),
            symbol: symbol.to_string(),
            score,
        }))
    }
}

/// Financial Modeling Prep social sentiment. Free tier allows 250 calls/day.
pub struct FmpProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    daily_budget: RateLimiter,
    timeout: Duration,
}

impl FmpProvider {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: FMP_BASE.to_string(),
            daily_budget: RateLimiter::new(250.0, 250.0 / 86_400.0),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }
}

/// Latest `sentimentScore / 100`, clamped to `[-1, 1]`.
pub fn fmp_score(body: &Value) -> Option<f64> {
    let latest = body.as_array()?.first()?;
    let raw = latest.get("sentimentScore").and_then(lenient_f64).unwrap_or(0.0);
    Some((raw / 100.0).clamp(-1.0, 1.0))
}

#[async_trait]
impl SentimentProvider for FmpProvider {
    fn name(&self) -> &str {
        "fmp"
    }

    async fn fetch_sentiment(&self, symbol: &str) -> Result<Option<ProviderSentiment>, FetchError> {
        let Some(key) = self.api_key.as_deref() else {
            tracing::debug!(provider = "fmp", "API key not configured, skipping");
            return Ok(None);
        };
        if !self.daily_budget.try_acquire(1.0).await {
            tracing::warn!(provider = "fmp", "daily request budget exhausted");
            return Ok(None);
        }

        let endpoint = format!("{}/historical/social-sentiment", self.base_url);
        let url = url::Url::parse_with_params(&endpoint, &[("symbol", symbol), ("apikey", key)])
            .map_err(|e| FetchError::parse(&endpoint, e.to_string()))?;
        let Some(body) = get_json(&self.http, url.as_str(), self.timeout).await? else {
            return Ok(None);
        };
        Ok(fmp_score(&body).map(|score| ProviderSentiment {
            provider: "fmp".into(),
            symbol: symbol.to_string(),
            score,
        }))
    }
}

/// Combined label and agreement-based confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSentiment {
    pub sentiment: Sentiment,
    pub confidence: f64,
    pub score: f64,
    /// Per-source scores, `llm` included.
    pub sources: BTreeMap<String, f64>,
}

/// Combine the model's label with external readings.
///
/// Mean of all scores decides the label (±0.3 thresholds). Confidence starts at 0.5 for one
/// source plus 0.1 per extra source and is scaled down by disagreement (population variance).
pub fn aggregate(llm: Sentiment, external: &[ProviderSentiment]) -> AggregatedSentiment {
    let mut sources = BTreeMap::new();
    sources.insert("llm".to_string(), llm.score());
    let mut scores = vec![llm.score()];
    for p in external {
        scores.push(p.score);
        sources.insert(p.provider.clone(), p.score);
    }

    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

    let base = 0.5 + 0.1 * (n - 1.0);
    let agreement = (1.0 - variance / 2.0).max(0.0);
    let confidence = (base * agreement).clamp(0.5, 1.0);

    let sentiment = if mean > 0.3 {
        Sentiment::Bullish
    } else if mean < -0.3 {
        Sentiment::Bearish
    } else {
        Sentiment::Neutral
    };

    AggregatedSentiment {
        sentiment,
        confidence: (confidence * 100.0).round() / 100.0,
        score: mean,
        sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(provider: &str, score: f64) -> ProviderSentiment {
        ProviderSentiment {
            provider: provider.into(),
            symbol: "BTCUSD".into(),
            score,
        }
    }

    #[test]
    fn llm_only_has_base_confidence() {
        let a = aggregate(Sentiment::Bullish, &[]);
        assert_eq!(a.sentiment, Sentiment::Bullish);
        assert_eq!(a.confidence, 0.5);
        assert_eq!(a.sources.len(), 1);
    }

    #[test]
    fn agreement_raises_confidence() {
        let a = aggregate(Sentiment::Bullish, &[p("finnhub", 1.0), p("fmp", 1.0)]);
        assert_eq!(a.sentiment, Sentiment::Bullish);
        assert_eq!(a.confidence, 0.7);
    }

    #[test]
    fn disagreement_pulls_to_neutral() {
        let a = aggregate(Sentiment::Bullish, &[p("finnhub", -1.0)]);
        assert_eq!(a.sentiment, Sentiment::Neutral);
        // variance 1.0 → 0.6 * 0.5 = 0.3, floored at 0.5
        assert_eq!(a.confidence, 0.5);
    }

    #[test]
    fn provider_scores() {
        let f = json!({"sentiment": {"bullishPercent": 0.75, "bearishPercent": 0.25}});
        assert_eq!(finnhub_score(&f), Some(0.5));
        assert_eq!(finnhub_score(&json!({"buzz": {}})), None);
        assert_eq!(fmp_score(&json!([{"sentimentScore": "250"}])), Some(1.0));
        assert_eq!(fmp_score(&json!([{"sentimentScore": -40}])), Some(-0.4));
        assert_eq!(fmp_score(&json!([])), None);
    }

    #[tokio::test]
    async fn unconfigured_providers_contribute_nothing() {
        let f = FinnhubProvider::new(reqwest::Client::new(), None);
        assert_eq!(f.fetch_sentiment("BTCUSD").await.unwrap(), None);
        let m = FmpProvider::new(reqwest::Client::new(), Some("  ".into()));
        assert_eq!(m.fetch_sentiment("BTCUSD").await.unwrap(), None);
    }
}
