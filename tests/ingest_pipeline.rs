// tests/ingest_pipeline.rs
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use cryptowire::dedup::Allowlist;
use cryptowire::enrich::llm::StaticLlm;
use cryptowire::enrich::mapper::API_PROVIDER_LABEL;
use cryptowire::enrich::Enricher;
use cryptowire::ingest::article::{FetchedPage, PageFetcher};
use cryptowire::ingest::providers::SourceFactory;
use cryptowire::ingest::types::{CandidateItem, FetchError, SourceAdapter};
use cryptowire::jobs::{ApiFetchJob, Job, JobContext, JobHandler, Pipeline, RssFetchJob};
use cryptowire::store::{ArticleStatus, AuditStatus, MarketImpact, Sentiment, SourceKind, SourceSpec, Store};

/// Hands out canned items and records the `since` each adapter was asked for.
#[derive(Default)]
struct CannedSources {
    rss: Vec<CandidateItem>,
    api: Vec<CandidateItem>,
    fail_rss: bool,
    seen_since: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

struct CannedAdapter {
    label: String,
    items: Result<Vec<CandidateItem>, u16>,
    seen_since: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

#[async_trait]
impl SourceAdapter for CannedAdapter {
    async fn fetch_candidates(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        self.seen_since.lock().unwrap().push(since);
        match &self.items {
            Ok(items) => Ok(items.clone()),
            Err(status) => Err(FetchError::Status {
                url: format!("https://{}/feed", self.label),
                status: *status,
            }),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

impl SourceFactory for CannedSources {
    fn rss(&self, label: &str, _feed_url: &str) -> Box<dyn SourceAdapter> {
        Box::new(CannedAdapter {
            label: label.into(),
            items: if self.fail_rss { Err(502) } else { Ok(self.rss.clone()) },
            seen_since: self.seen_since.clone(),
        })
    }

    fn news_api(&self, label: &str, _base_url: &str) -> Box<dyn SourceAdapter> {
        Box::new(CannedAdapter {
            label: label.into(),
            items: Ok(self.api.clone()),
            seen_since: self.seen_since.clone(),
        })
    }
}

struct NoPages;

#[async_trait]
impl PageFetcher for NoPages {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        Err(FetchError::parse(url, "not used"))
    }
}

async fn setup(sources: CannedSources, allow: &[&str]) -> (Store, Pipeline, i64, i64) {
    let store = Store::in_memory().await.unwrap();
    let rss = store
        .upsert_source(&SourceSpec {
            name: "CoinDesk".into(),
            kind: SourceKind::Rss,
            url: "https://www.coindesk.com/arc/outboundfeeds/rss/".into(),
            enabled: true,
        })
        .await
        .unwrap();
    let api = store
        .upsert_source(&SourceSpec {
            name: "Aggregator".into(),
            kind: SourceKind::Api,
            url: "https://news.example.com".into(),
            enabled: true,
        })
        .await
        .unwrap();
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(sources),
        Arc::new(NoPages),
        Arc::new(Enricher::new(Arc::new(StaticLlm::new("m", "{}")))),
        Allowlist::new(allow.iter().copied()),
    );
    (store, pipeline, rss.id, api.id)
}

fn rss_job(source_id: i64, backfill_hours: Option<i64>) -> RssFetchJob {
    RssFetchJob {
        source_id,
        source_name: "CoinDesk".into(),
        feed_url: "https://www.coindesk.com/arc/outboundfeeds/rss/".into(),
        backfill_hours,
    }
}

#[tokio::test]
async fn rss_items_are_deduplicated_and_stored_pending() {
    let now = Utc::now();
    let sources = CannedSources {
        rss: vec![
            CandidateItem::new("Bitcoin miners expand capacity in Texas", "https://www.coindesk.com/a", "CoinDesk")
                .published(now),
            // Same story, tracking parameter and trailing slash.
            CandidateItem::new("Bitcoin miners expand capacity in Texas", "https://coindesk.com/a/?utm_source=x", "CoinDesk")
                .published(now),
            // Near-identical headline on another URL.
            CandidateItem::new("Bitcoin miners expand capacity in Texas!", "https://www.coindesk.com/b", "CoinDesk")
                .published(now),
            CandidateItem::new("Top 10 crypto to buy this week", "https://www.coindesk.com/c", "CoinDesk"),
            CandidateItem::new("Ethereum developers set date for Pectra upgrade", "https://www.coindesk.com/d", "CoinDesk"),
        ],
        ..CannedSources::default()
    };
    let (store, pipeline, rss_id, _) = setup(sources, &[]).await;

    let stats = pipeline.fetch_rss(&rss_job(rss_id, None)).await.unwrap();
    assert_eq!(stats.fetched, 5);
    assert_eq!(stats.new_articles, 2);
    assert_eq!(stats.duplicates, 2);
    assert_eq!(stats.noise, 1);
    assert_eq!(stats.errors, 0);

    let pending = store.articles_by_status(ArticleStatus::Pending, 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].url_normalized, "https://coindesk.com/a");

    // A second run sees the stored window and adds nothing.
    let again = pipeline.fetch_rss(&rss_job(rss_id, None)).await.unwrap();
    assert_eq!(again.new_articles, 0);
    assert_eq!(again.duplicates, 4);
}

#[tokio::test]
async fn backfill_hours_set_the_lookback() {
    let sources = CannedSources::default();
    let seen = sources.seen_since.clone();
    let (_, pipeline, rss_id, _) = setup(sources, &[]).await;

    let before = Utc::now();
    pipeline.fetch_rss(&rss_job(rss_id, Some(48))).await.unwrap();
    pipeline.fetch_rss(&rss_job(rss_id, None)).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    let backfill = before - seen[0];
    assert!(backfill >= Duration::hours(48) - Duration::minutes(1) && backfill <= Duration::hours(48) + Duration::minutes(1));
    let default = before - seen[1];
    assert!(default >= Duration::hours(24) - Duration::minutes(1) && default <= Duration::hours(24) + Duration::minutes(1));
}

#[tokio::test]
async fn api_items_are_allowlisted_and_stored_enriched() {
    let mut cnbc = CandidateItem::new(
        "SEC approves spot ether ETF options listing",
        "https://www.cnbc.com/2025/01/02/ether-etf-options.html",
        "CNBC",
    );
    cnbc.category = Some("etf".into());
    cnbc.sentiment_hint = Some("positive".into());
    cnbc.tags = vec!["ETH".into()];
    cnbc.summary = Some("Options on spot ether ETFs will begin trading.".into());

    let blog = CandidateItem::new(
        "Random blog says ether could go anywhere now",
        "https://random.example/ether",
        "Random Blog",
    );

    let sources = CannedSources {
        api: vec![cnbc, blog],
        ..CannedSources::default()
    };
    let (store, pipeline, _, api_id) = setup(sources, &["cnbc"]).await;

    let job = ApiFetchJob {
        source_id: api_id,
        source_name: "Aggregator".into(),
        api_base_url: "https://news.example.com".into(),
        backfill_hours: None,
    };
    let stats = pipeline.fetch_api(&job).await.unwrap();
    assert_eq!(stats.new_articles, 1);
    assert_eq!(stats.noise, 1);

    let stored = store.articles_by_status(ArticleStatus::Enriched, 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    let e = store.get_enrichment(stored[0].id).await.unwrap().unwrap();
    assert_eq!(e.data.llm_provider, API_PROVIDER_LABEL);
    assert_eq!(e.data.sentiment, Sentiment::Bullish);
    assert_eq!(e.data.market_impact, MarketImpact::High);
    assert!(e.data.tags.contains(&"ETH".to_string()));
    assert_eq!(e.data.summary_th.as_deref(), Some("Options on spot ether ETFs will begin trading."));
}

#[tokio::test]
async fn failed_source_fetch_is_audited() {
    let sources = CannedSources {
        fail_rss: true,
        ..CannedSources::default()
    };
    let (store, pipeline, rss_id, _) = setup(sources, &[]).await;
    let ctx = JobContext {
        key: "rss-1-0".into(),
        attempt: 3,
        max_attempts: 3,
    };

    let err = pipeline.handle(Job::FetchRss(rss_job(rss_id, None)), ctx).await.unwrap_err();
    assert!(format!("{err:#}").contains("502"));

    let audits = store.audits_for_key("rss-1-0").await.unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[1].status, AuditStatus::Failed);
    assert!(audits[1].article_id.is_none());
}

#[tokio::test]
async fn successful_fetch_audit_carries_stats() {
    let sources = CannedSources {
        rss: vec![CandidateItem::new(
            "Solana validators approve fee market overhaul",
            "https://www.coindesk.com/sol",
            "CoinDesk",
        )],
        ..CannedSources::default()
    };
    let (store, pipeline, rss_id, _) = setup(sources, &[]).await;
    let ctx = JobContext {
        key: "rss-ok".into(),
        attempt: 1,
        max_attempts: 3,
    };
    pipeline.handle(Job::FetchRss(rss_job(rss_id, Some(6))), ctx).await.unwrap();

    let audits = store.audits_for_key("rss-ok").await.unwrap();
    assert_eq!(audits[1].status, AuditStatus::Completed);
    let meta = audits[1].metadata.clone().unwrap();
    assert_eq!(meta["stats"]["newArticles"], 1);
    assert_eq!(meta["sourceId"], rss_id);
}
