use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::time::Duration;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{CandidateItem, FetchError, SourceAdapter};
use crate::ingest::{fetch_text, normalize_text};
use crate::retry::{Retry, RetryPolicy};

const MAX_TITLE_CHARS: usize = 500;
const MAX_SUMMARY_CHARS: usize = 1500;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<String>,
}

/// RFC 2822 first (what RSS mandates), then RFC 3339 for feeds that ignore it.
pub(crate) fn parse_feed_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if let Ok(dt) = OffsetDateTime::parse(ts, &Rfc2822) {
        return DateTime::from_timestamp(dt.unix_timestamp(), 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse RSS 2.0 XML into candidates. Items without a link or title are dropped.
pub fn parse_feed(xml: &str, source_label: &str) -> Result<Vec<CandidateItem>, String> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&xml_clean).map_err(|e| format!("parsing rss xml: {e}"))?;

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let Some(link) = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) else {
            continue;
        };
        let title = normalize_text(it.title.as_deref().unwrap_or_default(), MAX_TITLE_CHARS);
        if title.is_empty() {
            continue;
        }
        let summary = it
            .description
            .as_deref()
            .map(|d| normalize_text(d, MAX_SUMMARY_CHARS))
            .filter(|d| !d.is_empty());

        out.push(CandidateItem {
            title,
            url: link,
            published_at: it.pub_date.as_deref().and_then(parse_feed_date),
            source_label: source_label.to_string(),
            summary,
            tags: it
                .categories
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            sentiment_hint: None,
            category: None,
        });
    }

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    Ok(out)
}

/// RSS feed adapter. One instance per feed; the retry policy and client are injected.
pub struct RssAdapter {
    label: String,
    feed_url: String,
    client: reqwest::Client,
    timeout: Duration,
    policy: RetryPolicy,
}

impl RssAdapter {
    pub fn new(label: impl Into<String>, feed_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            label: label.into(),
            feed_url: feed_url.into(),
            client,
            timeout: Duration::from_secs(30),
            policy: RetryPolicy::new(3, 1_000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    async fn fetch_candidates(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        let url = self.feed_url.as_str();
        let body = Retry::new(self.policy)
            .when(|e: &FetchError| e.is_transient())
            .on_retry(|e, n, d| {
                tracing::warn!(error = %e, attempt = n, delay_ms = d.as_millis() as u64, provider = %self.label, "rss fetch retry");
            })
            .run(|| fetch_text(&self.client, url, self.timeout, "application/rss+xml, application/xml, text/xml"))
            .await
            .inspect_err(|_| {
                counter!("ingest_provider_errors_total", "source" => self.label.clone()).increment(1);
            })?;

        let items = parse_feed(&body, &self.label).map_err(|reason| FetchError::parse(url, reason))?;
        Ok(items
            .into_iter()
            .filter(|it| it.published_at.map_or(true, |p| p >= since))
            .collect())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
