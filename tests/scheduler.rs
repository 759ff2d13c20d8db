// tests/scheduler.rs
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

use cryptowire::enrich::mapper::HEURISTIC_PROVIDER_LABEL;
use cryptowire::jobs::scheduler::{DigestSchedule, DigestSlot};
use cryptowire::jobs::{Broker, Job, JobContext, JobHandler, QueueConfig, Scheduler, SchedulerConfig};
use cryptowire::store::{
    ArticleStatus, NewArticle, NewMarketSummary, ScheduleType, SourceKind, SourceSpec, Store,
};

#[derive(Default)]
struct Collect(Mutex<Vec<(Job, String)>>);

#[async_trait]
impl JobHandler for Collect {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()> {
        self.0.lock().unwrap().push((job, ctx.key));
        Ok(())
    }
}

async fn store_with_sources() -> Store {
    let store = Store::in_memory().await.unwrap();
    for (name, kind, enabled) in [
        ("CoinDesk", SourceKind::Rss, true),
        ("Aggregator", SourceKind::Api, true),
        ("Dormant", SourceKind::Rss, false),
    ] {
        store
            .upsert_source(&SourceSpec {
                name: name.into(),
                kind,
                url: format!("https://{}.example.com/feed", name.to_lowercase()),
                enabled,
            })
            .await
            .unwrap();
    }
    store
}

fn scheduler(store: &Store, config: SchedulerConfig) -> (Scheduler, Broker, Arc<Collect>) {
    let collect = Arc::new(Collect::default());
    let (broker, _workers) = Broker::start(QueueConfig::default(), collect.clone());
    (Scheduler::new(store.clone(), broker.clone(), config), broker, collect)
}

async fn add_article(store: &Store, n: i64, status: ArticleStatus) -> i64 {
    let source = store.list_sources(true).await.unwrap()[0].id;
    let id = store
        .insert_article(&NewArticle {
            source_id: source,
            url: format!("https://coindesk.com/story-{n}"),
            url_normalized: format!("https://coindesk.com/story-{n}"),
            title_original: format!("Bitcoin rally extends to a record high, part {n}"),
            hash: format!("h{n}"),
            published_at: None,
            status: ArticleStatus::Pending,
            summary: None,
        })
        .await
        .unwrap()
        .unwrap();
    if status == ArticleStatus::Fetched {
        store.mark_fetched(id, &"body ".repeat(60), None).await.unwrap();
    }
    id
}

#[tokio::test]
async fn startup_backfill_covers_enabled_sources() {
    let store = store_with_sources().await;
    let (mut sched, broker, collect) = scheduler(&store, SchedulerConfig::default());

    assert_eq!(sched.startup_backfill().await.unwrap(), 2);
    broker.wait_idle().await;

    let jobs = collect.0.lock().unwrap().clone();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|(j, _)| matches!(j, Job::FetchRss(r) if r.backfill_hours == Some(24))));
    assert!(jobs.iter().any(|(j, _)| matches!(j, Job::FetchApiNews(a) if a.api_base_url.contains("aggregator"))));
}

#[tokio::test]
async fn sweeps_pending_and_fetched_articles() {
    let store = store_with_sources().await;
    let pending = add_article(&store, 1, ArticleStatus::Pending).await;
    let fetched = add_article(&store, 2, ArticleStatus::Fetched).await;
    let (sched, broker, collect) = scheduler(&store, SchedulerConfig::default());

    assert_eq!(sched.scan_pending().await.unwrap(), 1);
    assert_eq!(sched.scan_fetched().await.unwrap(), 1);
    broker.wait_idle().await;

    let keys: Vec<String> = collect.0.lock().unwrap().iter().map(|(_, k)| k.clone()).collect();
    assert!(keys.contains(&format!("fetch-article-{pending}")));
    assert!(keys.contains(&format!("enrich-{fetched}")));

    // Already-handled keys are not queued twice.
    assert_eq!(sched.scan_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn title_enrichment_when_llm_is_off() {
    let store = store_with_sources().await;
    let id = add_article(&store, 3, ArticleStatus::Fetched).await;
    let config = SchedulerConfig {
        enrichment_enabled: false,
        ..SchedulerConfig::default()
    };
    let (sched, _broker, collect) = scheduler(&store, config);

    assert_eq!(sched.scan_fetched().await.unwrap(), 1);
    assert!(collect.0.lock().unwrap().is_empty());

    let article = store.get_article(id).await.unwrap().unwrap();
    assert_eq!(article.status, ArticleStatus::Enriched);
    let e = store.get_enrichment(id).await.unwrap().unwrap();
    assert_eq!(e.data.llm_provider, HEURISTIC_PROVIDER_LABEL);
    assert_eq!(e.data.llm_model.as_deref(), Some("title-analysis"));
    assert!(e.data.tags.contains(&"BTC".to_string()));
}

fn morning_start() -> DateTime<Utc> {
    // 07:00 at UTC+7.
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn digest_fires_once_inside_the_window() {
    let store = store_with_sources().await;
    let config = SchedulerConfig {
        digest: Some(DigestSchedule {
            webhook_url: Some("https://discord.test/hook".into()),
            ..DigestSchedule::default()
        }),
        ..SchedulerConfig::default()
    };
    let (mut sched, broker, collect) = scheduler(&store, config);

    let before = morning_start() - Duration::minutes(5);
    assert!(sched.check_digests(before).await.unwrap().is_empty());

    let late = morning_start() + Duration::minutes(91);
    assert!(sched.check_digests(late).await.unwrap().is_empty());

    let now = morning_start() + Duration::minutes(10);
    assert_eq!(sched.check_digests(now).await.unwrap(), vec![ScheduleType::Morning]);
    assert!(sched.check_digests(now + Duration::minutes(1)).await.unwrap().is_empty());
    broker.wait_idle().await;

    let jobs = collect.0.lock().unwrap().clone();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1, "summary-2025-06-01-morning");
    match &jobs[0].0 {
        Job::GenerateDigest(d) => {
            assert_eq!(d.schedule_type, ScheduleType::Morning);
            assert_eq!(d.webhook_url.as_deref(), Some("https://discord.test/hook"));
        }
        other => panic!("unexpected job {other:?}"),
    }
}

#[tokio::test]
async fn late_slot_window_runs_past_local_midnight() {
    let store = store_with_sources().await;
    let config = SchedulerConfig {
        digest: Some(DigestSchedule {
            slots: vec![DigestSlot {
                schedule: ScheduleType::Evening,
                at: NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
            }],
            ..DigestSchedule::default()
        }),
        ..SchedulerConfig::default()
    };
    let (mut sched, broker, collect) = scheduler(&store, config);

    // 00:30 on 2025-06-02 at UTC+7, one hour into the slot that started on 2025-06-01.
    let after_midnight = Utc.with_ymd_and_hms(2025, 6, 1, 17, 30, 0).unwrap();
    assert_eq!(
        sched.check_digests(after_midnight).await.unwrap(),
        vec![ScheduleType::Evening]
    );
    assert!(sched
        .check_digests(after_midnight + Duration::minutes(20))
        .await
        .unwrap()
        .is_empty());
    // 01:05 local: the window has closed.
    assert!(sched
        .check_digests(after_midnight + Duration::minutes(35))
        .await
        .unwrap()
        .is_empty());
    broker.wait_idle().await;

    let jobs = collect.0.lock().unwrap().clone();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1, "summary-2025-06-01-evening");
}

#[tokio::test]
async fn stored_summary_suppresses_a_restarted_slot() {
    let store = store_with_sources().await;
    store
        .insert_summary(&NewMarketSummary {
            schedule_type: ScheduleType::Evening,
            summary_text: "สรุปตลาดช่วงเย็น".into(),
            section_title: None,
            headlines: Vec::new(),
            prices: Vec::new(),
            llm_model: None,
        })
        .await
        .unwrap();
    let (mut sched, _broker, _collect) = scheduler(&store, SchedulerConfig::default());

    // The summary was written "now", which is after any past slot start.
    let evening = morning_start() + Duration::hours(12) + Duration::minutes(5);
    assert!(sched.check_digests(evening).await.unwrap().is_empty());
    // Morning has no summary yet.
    let morning = morning_start() + Duration::minutes(5);
    assert_eq!(sched.check_digests(morning).await.unwrap(), vec![ScheduleType::Morning]);
}

#[tokio::test]
async fn disabled_digest_never_fires() {
    let store = store_with_sources().await;
    let config = SchedulerConfig {
        digest: None,
        ..SchedulerConfig::default()
    };
    let (mut sched, _broker, _collect) = scheduler(&store, config);
    assert!(sched.check_digests(morning_start()).await.unwrap().is_empty());
}
