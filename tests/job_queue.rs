// tests/job_queue.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use cryptowire::ingest::types::FetchError;
use cryptowire::jobs::{ArticleJob, Broker, EnqueueOutcome, Job, JobContext, JobHandler, QueueConfig, QueueKind};
use cryptowire::retry::RetryPolicy;

/// Records every execution and tracks peak parallelism. Article ids pick the behaviour:
/// `< 100` succeed, `100..200` fail with a 503 twice then succeed, `>= 200` fail for good.
#[derive(Default)]
struct Recorder {
    runs: Mutex<Vec<(String, u32)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.runs.lock().unwrap().push((ctx.key.clone(), ctx.attempt));

        let id = job.article_id().unwrap_or_default();
        match id {
            100..=199 if ctx.attempt < 3 => Err(anyhow::Error::new(FetchError::Status {
                url: format!("https://news.test/{id}"),
                status: 503,
            })),
            200.. => Err(anyhow!("permanent failure for {id}")),
            _ => Ok(()),
        }
    }
}

fn config() -> QueueConfig {
    QueueConfig {
        retry_backoff: RetryPolicy::new(3, 10),
        ..QueueConfig::default()
    }
}

fn fetch(id: i64) -> Job {
    Job::FetchArticle(ArticleJob { article_id: id })
}

#[tokio::test]
async fn duplicate_keys_are_dropped() {
    let rec = Arc::new(Recorder::default());
    let (broker, _workers) = Broker::start(config(), rec.clone());

    assert_eq!(broker.enqueue(fetch(1)), EnqueueOutcome::Enqueued);
    assert_eq!(broker.enqueue(fetch(1)), EnqueueOutcome::Deduplicated);
    broker.wait_idle().await;

    // Completed keys stay known, so the job is not run again.
    assert_eq!(broker.enqueue(fetch(1)), EnqueueOutcome::Deduplicated);
    // Same id on another queue has another key.
    assert_eq!(
        broker.enqueue(Job::EnrichArticle(ArticleJob { article_id: 1 })),
        EnqueueOutcome::Enqueued
    );
    broker.wait_idle().await;

    let runs = rec.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].0, "fetch-article-1");
    assert_eq!(runs[1].0, "enrich-1");
}

#[tokio::test]
async fn concurrency_is_bounded_per_queue() {
    let rec = Arc::new(Recorder::default());
    let cfg = config().with_concurrency(QueueKind::ArticleFetch, 2);
    let (broker, _workers) = Broker::start(cfg, rec.clone());

    for id in 1..=8 {
        broker.enqueue(fetch(id));
    }
    broker.wait_idle().await;

    assert_eq!(rec.runs.lock().unwrap().len(), 8);
    assert!(rec.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(broker.pending(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let rec = Arc::new(Recorder::default());
    let (broker, _workers) = Broker::start(config(), rec.clone());

    broker.enqueue(fetch(150));
    broker.wait_idle().await;

    let attempts: Vec<u32> = rec.runs.lock().unwrap().iter().map(|(_, a)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn backoff_does_not_hold_a_queue_slot() {
    let rec = Arc::new(Recorder::default());
    let cfg = QueueConfig {
        retry_backoff: RetryPolicy::new(3, 500),
        ..QueueConfig::default()
    }
    .with_concurrency(QueueKind::ArticleFetch, 1);
    let (broker, _workers) = Broker::start(cfg, rec.clone());

    broker.enqueue(fetch(150));
    broker.enqueue(fetch(1));

    // Job 1 runs while job 150 waits out its first 500ms backoff.
    let ran = tokio::time::timeout(Duration::from_millis(200), async {
        while !rec.runs.lock().unwrap().iter().any(|(k, _)| k == "fetch-article-1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(ran.is_ok());

    broker.wait_idle().await;
    let runs = rec.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 4);
    assert_eq!(runs[1], ("fetch-article-1".to_string(), 1));
    assert_eq!(runs[3], ("fetch-article-150".to_string(), 3));
}

#[tokio::test]
async fn permanent_failures_run_once_and_stay_known() {
    let rec = Arc::new(Recorder::default());
    let (broker, _workers) = Broker::start(config(), rec.clone());

    broker.enqueue(fetch(250));
    broker.wait_idle().await;
    assert_eq!(rec.runs.lock().unwrap().len(), 1);
    assert_eq!(broker.enqueue(fetch(250)), EnqueueOutcome::Deduplicated);
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let rec = Arc::new(Recorder::default());
    let cfg = QueueConfig {
        max_attempts: 2,
        ..config()
    };
    let (broker, _workers) = Broker::start(cfg, rec.clone());

    broker.enqueue(fetch(120));
    broker.wait_idle().await;
    assert_eq!(rec.runs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn shutdown_stops_dispatchers() {
    let rec = Arc::new(Recorder::default());
    let (broker, workers) = Broker::start(config(), rec);
    broker.shutdown();
    let joined = tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(workers)).await;
    assert!(joined.is_ok());
}
