//! Periodic driver: enqueues source fetches, sweeps `PENDING`/`FETCHED` articles into the
//! article queues and fires the morning/evening digests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::queue::{Broker, EnqueueOutcome};
use super::{summary_key, ApiFetchJob, ArticleJob, DigestJob, Job, RssFetchJob};
use crate::enrich::mapper::heuristic_enrichment;
use crate::store::{ArticleStatus, ScheduleType, Source, SourceKind, Store};

/// One daily digest slot, in the digest timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DigestSlot {
    pub schedule: ScheduleType,
    pub at: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct DigestSchedule {
    pub utc_offset: FixedOffset,
    pub slots: Vec<DigestSlot>,
    /// How long after a slot's start a missed run is still fired.
    pub window: chrono::Duration,
    pub webhook_url: Option<String>,
}

/// `UTC+hours`, or UTC when the offset is out of range.
pub fn offset_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| Utc.fix())
}

impl Default for DigestSchedule {
    fn default() -> Self {
        Self {
            utc_offset: offset_hours(7),
            slots: vec![
                DigestSlot {
                    schedule: ScheduleType::Morning,
                    at: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
                },
                DigestSlot {
                    schedule: ScheduleType::Evening,
                    at: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or_default(),
                },
            ],
            window: chrono::Duration::minutes(90),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fetch_interval: Duration,
    pub poll_interval: Duration,
    pub pending_batch: i64,
    pub enrich_batch: i64,
    /// When off, fetched articles get a title-only enrichment inline instead of an LLM job.
    pub enrichment_enabled: bool,
    pub startup_backfill_hours: i64,
    pub digest: Option<DigestSchedule>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(10),
            pending_batch: 10,
            enrich_batch: 5,
            enrichment_enabled: true,
            startup_backfill_hours: 24,
            digest: Some(DigestSchedule::default()),
        }
    }
}

pub struct Scheduler {
    store: Store,
    broker: Broker,
    config: SchedulerConfig,
    /// Digest keys already handled, with their slot start.
    fired: HashMap<String, DateTime<Utc>>,
    last_fetch: Option<Instant>,
}

impl Scheduler {
    pub fn new(store: Store, broker: Broker, config: SchedulerConfig) -> Self {
        Self {
            store,
            broker,
            config,
            fired: HashMap::new(),
            last_fetch: None,
        }
    }

    fn fetch_job(source: &Source, backfill_hours: Option<i64>) -> Job {
        match source.kind {
            SourceKind::Rss => Job::FetchRss(RssFetchJob {
                source_id: source.id,
                source_name: source.name.clone(),
                feed_url: source.url.clone(),
                backfill_hours,
            }),
            SourceKind::Api => Job::FetchApiNews(ApiFetchJob {
                source_id: source.id,
                source_name: source.name.clone(),
                api_base_url: source.url.clone(),
                backfill_hours,
            }),
        }
    }

    /// One fetch job per enabled source. Returns how many were accepted.
    pub async fn schedule_fetches(&mut self, backfill_hours: Option<i64>) -> Result<usize> {
        let sources = self.store.list_sources(true).await.context("listing sources")?;
        let mut enqueued = 0;
        for source in &sources {
            if self.broker.enqueue(Self::fetch_job(source, backfill_hours)) == EnqueueOutcome::Enqueued {
                enqueued += 1;
            }
        }
        self.last_fetch = Some(Instant::now());
        debug!(sources = sources.len(), enqueued, "scheduled source fetches");
        Ok(enqueued)
    }

    /// Backfill every enabled source once at startup.
    pub async fn startup_backfill(&mut self) -> Result<usize> {
        let hours = self.config.startup_backfill_hours;
        let n = self.schedule_fetches(Some(hours)).await?;
        info!(jobs = n, backfill_hours = hours, "startup backfill scheduled");
        Ok(n)
    }

    /// Oldest `PENDING` articles go to the article-fetch queue.
    pub async fn scan_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .articles_by_status(ArticleStatus::Pending, self.config.pending_batch)
            .await?;
        let mut enqueued = 0;
        for article in &pending {
            let job = Job::FetchArticle(ArticleJob { article_id: article.id });
            if self.broker.enqueue(job) == EnqueueOutcome::Enqueued {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Oldest `FETCHED` articles are enriched: through the enrich queue, or inline from the title
    /// when LLM enrichment is off.
    pub async fn scan_fetched(&self) -> Result<usize> {
        let fetched = self
            .store
            .articles_by_status(ArticleStatus::Fetched, self.config.enrich_batch)
            .await?;
        let mut handled = 0;
        for article in &fetched {
            if self.config.enrichment_enabled {
                let job = Job::EnrichArticle(ArticleJob { article_id: article.id });
                if self.broker.enqueue(job) == EnqueueOutcome::Enqueued {
                    handled += 1;
                }
                continue;
            }
            let enrichment = heuristic_enrichment(article.id, &article.title_original);
            match self.store.complete_enrichment(&enrichment).await {
                Ok(()) => handled += 1,
                Err(e) => warn!(article_id = article.id, error = ?e, "heuristic enrichment failed"),
            }
        }
        Ok(handled)
    }

    /// Enqueue digests whose slot started within the recovery window and that have neither fired
    /// in this process nor been stored since the slot began.
    pub async fn check_digests(&mut self, now: DateTime<Utc>) -> Result<Vec<ScheduleType>> {
        let Some(schedule) = self.config.digest.clone() else {
            return Ok(Vec::new());
        };
        let local = now.with_timezone(&schedule.utc_offset);
        let keep = schedule.window.max(chrono::Duration::days(1));
        self.fired.retain(|_, start| *start + keep > now);

        let today = local.date_naive();
        // A late slot's window can run past local midnight, so yesterday's slots are checked too.
        let days = [today.pred_opt(), Some(today)];
        let mut fired = Vec::new();
        for day in days.into_iter().flatten() {
            for slot in &schedule.slots {
                let Some(start) = day.and_time(slot.at).and_local_timezone(schedule.utc_offset).single() else {
                    continue;
                };
                let start = start.with_timezone(&Utc);
                if now < start || now >= start + schedule.window {
                    continue;
                }

                let key = summary_key(day, slot.schedule);
                if self.fired.contains_key(&key) {
                    continue;
                }
                if let Some(last) = self.store.last_summary_at(Some(slot.schedule)).await? {
                    if last >= start {
                        self.fired.insert(key, start);
                        continue;
                    }
                }

                let job = Job::GenerateDigest(DigestJob {
                    schedule_type: slot.schedule,
                    webhook_url: schedule.webhook_url.clone(),
                });
                let outcome = self.broker.enqueue_with_key(job, key.clone());
                self.fired.insert(key.clone(), start);
                if outcome == EnqueueOutcome::Enqueued {
                    info!(job_key = %key, schedule = %slot.schedule, "digest scheduled");
                    fired.push(slot.schedule);
                }
            }
        }
        Ok(fired)
    }

    fn fetch_due(&self) -> bool {
        self.last_fetch
            .map_or(true, |at| at.elapsed() >= self.config.fetch_interval)
    }

    /// One loop iteration. Each step is independent; a failing step is logged and the rest run.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        if self.fetch_due() {
            if let Err(e) = self.schedule_fetches(None).await {
                warn!(error = ?e, "scheduling fetches failed");
            }
        }
        if let Err(e) = self.scan_pending().await {
            warn!(error = ?e, "pending scan failed");
        }
        if let Err(e) = self.scan_fetched().await {
            warn!(error = ?e, "fetched scan failed");
        }
        if let Err(e) = self.check_digests(now).await {
            warn!(error = ?e, "digest check failed");
        }
    }

    /// Backfill, then tick every `poll_interval` until the task is aborted.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.startup_backfill().await {
                warn!(error = ?e, "startup backfill failed");
            }
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_slots_are_bangkok_morning_and_evening() {
        let d = DigestSchedule::default();
        assert_eq!(d.utc_offset.local_minus_utc(), 7 * 3600);
        assert_eq!(d.slots.len(), 2);
        assert_eq!(d.slots[0].at, NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        assert_eq!(d.slots[1].schedule, ScheduleType::Evening);
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        assert_eq!(offset_hours(30).local_minus_utc(), 0);
        assert_eq!(offset_hours(-5).local_minus_utc(), -5 * 3600);
    }
}
