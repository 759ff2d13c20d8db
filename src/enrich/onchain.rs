//! On-chain metrics (Santiment GraphQL) with a TTL cache and a daily request budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ingest::types::FetchError;
use crate::ratelimit::RateLimiter;

const SANTIMENT_ENDPOINT: &str = "https://api.santiment.net/graphql";
pub const METRICS_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainMetrics {
    pub slug: String,
    pub social_volume: Option<f64>,
    pub dev_activity: Option<f64>,
    pub active_addresses: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    fn name(&self) -> &str;
    /// `Ok(None)` when unconfigured, throttled or without data.
    async fn fetch_metrics(&self, slug: &str) -> Result<Option<OnchainMetrics>, FetchError>;
}

const QUERY: &str = r#"
query($slug: String!, $from: DateTime!, $to: DateTime!) {
  socialVolume: getMetric(metric: "social_volume_total") {
    timeseriesData(slug: $slug, from: $from, to: $to, interval: "1d") { datetime value }
  }
  devActivity: getMetric(metric: "dev_activity") {
    timeseriesData(slug: $slug, from: $from, to: $to, interval: "1d") { datetime value }
  }
  activeAddresses: getMetric(metric: "active_addresses_24h") {
    timeseriesData(slug: $slug, from: $from, to: $to, interval: "1d") { datetime value }
  }
}
"#;

pub struct SantimentProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    timeout: Duration,
}

impl SantimentProvider {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            endpoint: SANTIMENT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

fn first_value(data: &Value, alias: &str) -> Option<f64> {
    let v = data.get(alias)?.get("timeseriesData")?.get(0)?.get("value")?;
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Map a GraphQL response body to metrics. GraphQL `errors` or a missing `data` yield `None`.
pub fn parse_santiment(slug: &str, body: &Value) -> Option<OnchainMetrics> {
    if body.get("errors").is_some_and(|e| !e.is_null()) {
        return None;
    }
    let data = body.get("data").filter(|d| !d.is_null())?;
    Some(OnchainMetrics {
        slug: slug.to_string(),
        social_volume: first_value(data, "socialVolume"),
        dev_activity: first_value(data, "devActivity"),
        active_addresses: first_value(data, "activeAddresses"),
        fetched_at: Utc::now(),
    })
}

#[async_trait]
impl MetricsProvider for SantimentProvider {
    fn name(&self) -> &str {
        "santiment"
    }

    async fn fetch_metrics(&self, slug: &str) -> Result<Option<OnchainMetrics>, FetchError> {
        let Some(key) = self.api_key.as_deref() else {
            tracing::debug!(provider = "santiment", "API key not configured, skipping");
            return Ok(None);
        };
        let to = Utc::now();
        let from = to - chrono::Duration::days(1);
        let body = json!({
            "query": QUERY,
            "variables": { "slug": slug, "from": from.to_rfc3339(), "to": to.to_rfc3339() },
        });

        let url = self.endpoint.as_str();
        let rsp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header(reqwest::header::AUTHORIZATION, format!("Apikey {key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, self.timeout, e))?;
        let status = rsp.status();
        if status.as_u16() == 429 {
            tracing::warn!(provider = "santiment", "rate limit exceeded");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let text = rsp
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, self.timeout, e))?;
        let value: Value = serde_json::from_str(&text).map_err(|e| FetchError::parse(url, e.to_string()))?;
        let metrics = parse_santiment(slug, &value);
        if metrics.is_none() {
            tracing::warn!(provider = "santiment", slug, "no data in response");
        }
        Ok(metrics)
    }
}

/// TTL cache plus request budget in front of any metrics provider. Cache hits do not spend
/// budget; an exhausted budget yields `None` instead of waiting.
pub struct CachedMetrics {
    inner: Arc<dyn MetricsProvider>,
    ttl: Duration,
    budget: RateLimiter,
    cache: Mutex<HashMap<String, (Instant, OnchainMetrics)>>,
}

impl CachedMetrics {
    /// Santiment free tier: about 100 requests/day.
    pub fn new(inner: Arc<dyn MetricsProvider>) -> Self {
        Self::with_budget(inner, METRICS_TTL, RateLimiter::new(100.0, 0.001157))
    }

    pub fn with_budget(inner: Arc<dyn MetricsProvider>, ttl: Duration, budget: RateLimiter) -> Self {
        Self {
            inner,
            ttl,
            budget,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MetricsProvider for CachedMetrics {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_metrics(&self, slug: &str) -> Result<Option<OnchainMetrics>, FetchError> {
        if let Some((at, hit)) = self.cache.lock().await.get(slug) {
            if at.elapsed() < self.ttl {
                tracing::debug!(slug, "on-chain metrics cache hit");
                return Ok(Some(hit.clone()));
            }
        }
        if !self.budget.try_acquire(1.0).await {
            tracing::warn!(provider = self.inner.name(), slug, "request budget exhausted");
            return Ok(None);
        }
        let fresh = self.inner.fetch_metrics(slug).await?;
        if let Some(m) = &fresh {
            self.cache
                .lock()
                .await
                .insert(slug.to_string(), (Instant::now(), m.clone()));
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl MetricsProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn fetch_metrics(&self, slug: &str) -> Result<Option<OnchainMetrics>, FetchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(OnchainMetrics {
                slug: slug.into(),
                social_volume: Some(1.0),
                dev_activity: None,
                active_addresses: None,
                fetched_at: Utc::now(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_after_ttl() {
        let inner = Arc::new(Counting(AtomicUsize::new(0)));
        let cached = CachedMetrics::new(inner.clone());
        cached.fetch_metrics("bitcoin").await.unwrap();
        cached.fetch_metrics("bitcoin").await.unwrap();
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);

        tokio::time::advance(METRICS_TTL + Duration::from_secs(1)).await;
        cached.fetch_metrics("bitcoin").await.unwrap();
        assert_eq!(inner.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_absent_not_blocking() {
        let inner = Arc::new(Counting(AtomicUsize::new(0)));
        let cached = CachedMetrics::with_budget(inner.clone(), METRICS_TTL, RateLimiter::new(1.0, 0.0001));
        assert!(cached.fetch_metrics("bitcoin").await.unwrap().is_some());
        assert!(cached.fetch_metrics("ethereum").await.unwrap().is_none());
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parses_graphql_body() {
        let body = json!({"data": {
            "socialVolume": {"timeseriesData": [{"datetime": "x", "value": 1520.0}]},
            "devActivity": {"timeseriesData": []},
            "activeAddresses": {"timeseriesData": [{"datetime": "x", "value": "830000"}]}
        }});
        let m = parse_santiment("bitcoin", &body).unwrap();
        assert_eq!(m.social_volume, Some(1520.0));
        assert_eq!(m.dev_activity, None);
        assert_eq!(m.active_addresses, Some(830000.0));
        assert!(parse_santiment("bitcoin", &json!({"errors": [{"message": "bad"}]})).is_none());
    }
}
