//! # Jobs
//! Typed job payloads, the named queues they run on, and their idempotency keys.
//!
//! Each [`Job`] variant maps to exactly one [`QueueKind`]; the broker in [`queue`] runs every
//! queue with its own fixed concurrency and at most one live job per key.

pub mod handlers;
pub mod queue;
pub mod scheduler;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{JobType, ScheduleType};

pub use handlers::Pipeline;
pub use queue::{Broker, EnqueueOutcome, JobContext, JobHandler, QueueConfig};
pub use scheduler::{Scheduler, SchedulerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    RssFetch,
    ApiNewsFetch,
    ArticleFetch,
    Enrich,
    Summary,
}

impl QueueKind {
    pub const ALL: [QueueKind; 5] = [
        QueueKind::RssFetch,
        QueueKind::ApiNewsFetch,
        QueueKind::ArticleFetch,
        QueueKind::Enrich,
        QueueKind::Summary,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::RssFetch => "rss-fetch",
            QueueKind::ApiNewsFetch => "api-news-fetch",
            QueueKind::ArticleFetch => "article-fetch",
            QueueKind::Enrich => "enrich",
            QueueKind::Summary => "summary",
        }
    }

    /// Worker count when the config does not override it. The aggregator API queue stays at 1
    /// for its 1 req/s limit; the summary queue stays at 1 to keep delivery ordered.
    pub fn default_concurrency(&self) -> usize {
        match self {
            QueueKind::RssFetch => 2,
            QueueKind::ApiNewsFetch => 1,
            QueueKind::ArticleFetch => 3,
            QueueKind::Enrich => 2,
            QueueKind::Summary => 1,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssFetchJob {
    pub source_id: i64,
    pub source_name: String,
    pub feed_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_hours: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFetchJob {
    pub source_id: i64,
    pub source_name: String,
    pub api_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_hours: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleJob {
    pub article_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestJob {
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Closed set of jobs; the variant decides the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Job {
    FetchRss(RssFetchJob),
    FetchApiNews(ApiFetchJob),
    FetchArticle(ArticleJob),
    EnrichArticle(ArticleJob),
    GenerateDigest(DigestJob),
}

impl Job {
    pub fn queue(&self) -> QueueKind {
        match self {
            Job::FetchRss(_) => QueueKind::RssFetch,
            Job::FetchApiNews(_) => QueueKind::ApiNewsFetch,
            Job::FetchArticle(_) => QueueKind::ArticleFetch,
            Job::EnrichArticle(_) => QueueKind::Enrich,
            Job::GenerateDigest(_) => QueueKind::Summary,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Job::FetchRss(_) => JobType::FetchRss,
            Job::FetchApiNews(_) => JobType::FetchApiNews,
            Job::FetchArticle(_) => JobType::FetchArticle,
            Job::EnrichArticle(_) => JobType::EnrichArticle,
            Job::GenerateDigest(_) => JobType::GenerateDigest,
        }
    }

    pub fn article_id(&self) -> Option<i64> {
        match self {
            Job::FetchArticle(a) | Job::EnrichArticle(a) => Some(a.article_id),
            _ => None,
        }
    }

    /// Natural idempotency key at `now`. Fetch jobs for one source share a key per minute.
    pub fn default_key(&self, now: DateTime<Utc>) -> String {
        match self {
            Job::FetchRss(j) => rss_key(j.source_id, now),
            Job::FetchApiNews(j) => api_key(j.source_id, now),
            Job::FetchArticle(a) => fetch_article_key(a.article_id),
            Job::EnrichArticle(a) => enrich_key(a.article_id),
            Job::GenerateDigest(d) => summary_key(now.date_naive(), d.schedule_type),
        }
    }
}

fn minute_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp() / 60
}

pub fn fetch_article_key(article_id: i64) -> String {
    format!("fetch-article-{article_id}")
}

pub fn enrich_key(article_id: i64) -> String {
    format!("enrich-{article_id}")
}

pub fn rss_key(source_id: i64, now: DateTime<Utc>) -> String {
    format!("rss-{source_id}-{}", minute_bucket(now))
}

pub fn api_key(source_id: i64, now: DateTime<Utc>) -> String {
    format!("api-{source_id}-{}", minute_bucket(now))
}

/// `date` is the calendar date of the slot in the digest timezone.
pub fn summary_key(date: NaiveDate, schedule: ScheduleType) -> String {
    format!("summary-{}-{}", date.format("%Y-%m-%d"), schedule.as_str())
}
