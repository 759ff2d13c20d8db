//! Aggregator news API client.
//!
//! `GET {base}/api/news?limit=N&since=<RFC3339>` returning
//! `{ "articles": [ { title, link|url, description, pubDate|publishedAt, source, category,
//! sentiment, tickers } ], "totalCount": n }`. Provider field aliases are resolved here so the
//! rest of the pipeline only sees `CandidateItem`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use serde::Deserialize;
use std::time::Duration;

use super::rss::parse_feed_date;
use crate::ingest::types::{CandidateItem, FetchError, SourceAdapter};
use crate::ingest::{fetch_text, normalize_text};
use crate::retry::{Retry, RetryPolicy};

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    articles: Vec<ApiArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiArticle {
    title: Option<String>,
    link: Option<String>,
    url: Option<String>,
    description: Option<String>,
    pub_date: Option<String>,
    published_at: Option<String>,
    source: Option<String>,
    category: Option<String>,
    sentiment: Option<String>,
    #[serde(default)]
    tickers: Vec<String>,
}

/// Map one API response body into candidates. Items missing a title or link are dropped.
pub fn parse_articles(body: &str, fallback_label: &str) -> Result<Vec<CandidateItem>, String> {
    let rsp: ApiResponse =
        serde_json::from_str(body).map_err(|e| format!("decoding news api json: {e}"))?;
    Ok(rsp
        .articles
        .into_iter()
        .filter_map(|a| {
            let url = a
                .link
                .or(a.url)
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())?;
            let title = normalize_text(a.title.as_deref().unwrap_or_default(), 500);
            if title.is_empty() {
                return None;
            }
            let published_at = a
                .published_at
                .or(a.pub_date)
                .as_deref()
                .and_then(parse_feed_date);
            Some(CandidateItem {
                title,
                url,
                published_at,
                source_label: a
                    .source
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| fallback_label.to_string()),
                summary: a
                    .description
                    .map(|d| normalize_text(&d, 1500))
                    .filter(|d| !d.is_empty()),
                tags: a
                    .tickers
                    .into_iter()
                    .map(|t| t.trim().to_ascii_uppercase())
                    .filter(|t| !t.is_empty())
                    .collect(),
                sentiment_hint: a.sentiment.map(|s| s.to_ascii_lowercase()),
                category: a.category.map(|c| c.to_ascii_lowercase()),
            })
        })
        .collect())
}

pub struct NewsApiAdapter {
    label: String,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    limit: u32,
    policy: RetryPolicy,
}

impl NewsApiAdapter {
    pub fn new(label: impl Into<String>, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            label: label.into(),
            base_url: base_url.into(),
            client,
            timeout: Duration::from_secs(30),
            limit: DEFAULT_PAGE_LIMIT,
            policy: RetryPolicy::new(3, 2_000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn request_url(&self, since: DateTime<Utc>) -> Result<String, FetchError> {
        let base = self.base_url.trim_end_matches('/');
        let mut url = url::Url::parse(&format!("{base}/api/news"))
            .map_err(|e| FetchError::parse(base, format!("bad api base url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("limit", &self.limit.to_string())
            .append_pair("since", &since.to_rfc3339_opts(SecondsFormat::Millis, true));
        Ok(url.into())
    }
}

#[async_trait]
impl SourceAdapter for NewsApiAdapter {
    async fn fetch_candidates(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        let url = self.request_url(since)?;
        let body = Retry::new(self.policy)
            .when(|e: &FetchError| e.is_transient())
            .on_retry(|e, n, d| {
                tracing::warn!(error = %e, attempt = n, delay_ms = d.as_millis() as u64, provider = %self.label, "news api retry");
            })
            .run(|| fetch_text(&self.client, &url, self.timeout, "application/json"))
            .await
            .inspect_err(|_| {
                counter!("ingest_provider_errors_total", "source" => self.label.clone()).increment(1);
            })?;
        parse_articles(&body, &self.label).map_err(|reason| FetchError::parse(&url, reason))
    }

    fn name(&self) -> &str {
        &self.label
    }
}
