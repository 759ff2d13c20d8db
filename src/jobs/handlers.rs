//! Job handlers: ingestion, article fetch, enrichment and digest, plus the audit trail that
//! wraps every execution.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::queue::{JobContext, JobHandler};
use super::{ApiFetchJob, DigestJob, Job, RssFetchJob};
use crate::dedup::{Allowlist, DedupEngine, Verdict};
use crate::digest::DigestGenerator;
use crate::enrich::mapper::map_api_item;
use crate::enrich::{quality_gate, EnrichInput, Enricher, Gate};
use crate::ingest::article::PageFetcher;
use crate::ingest::providers::SourceFactory;
use crate::store::{ArticleStatus, AuditStatus, NewArticle, NewAudit, SourceKind, Store};

/// Rolling window the dedup engine compares against.
pub const DEDUP_WINDOW_DAYS: i64 = 7;
/// Lookback for periodic fetches that carry no `backfillHours`.
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// `a: b: c` rendering of an error chain for audit rows. A cause whose message the previous
/// link already repeats (sqlx and thiserror wrappers often do) is left out.
pub fn error_chain(err: &anyhow::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let msg = cause.to_string();
        if parts.last().is_some_and(|prev| prev.contains(&msg)) {
            continue;
        }
        parts.push(msg);
    }
    parts.join(": ")
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub fetched: usize,
    pub new_articles: usize,
    pub duplicates: usize,
    pub noise: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { chars: usize },
    /// Article was no longer `PENDING` when the job ran.
    NotPending(ArticleStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    Enriched,
    AlreadyEnriched,
    Skipped(Gate),
}

impl EnrichOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            EnrichOutcome::Enriched => "enriched",
            EnrichOutcome::AlreadyEnriched => "already_enriched",
            EnrichOutcome::Skipped(_) => "skipped",
        }
    }
}

pub struct Pipeline {
    store: Store,
    sources: Arc<dyn SourceFactory>,
    pages: Arc<dyn PageFetcher>,
    enricher: Arc<Enricher>,
    digest: Option<Arc<DigestGenerator>>,
    allowlist: Allowlist,
}

impl Pipeline {
    pub fn new(
        store: Store,
        sources: Arc<dyn SourceFactory>,
        pages: Arc<dyn PageFetcher>,
        enricher: Arc<Enricher>,
        allowlist: Allowlist,
    ) -> Self {
        Self {
            store,
            sources,
            pages,
            enricher,
            digest: None,
            allowlist,
        }
    }

    pub fn with_digest(mut self, digest: Arc<DigestGenerator>) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn fetch_rss(&self, job: &RssFetchJob) -> Result<IngestStats> {
        self.ingest(SourceKind::Rss, job.source_id, &job.source_name, &job.feed_url, job.backfill_hours)
            .await
    }

    pub async fn fetch_api(&self, job: &ApiFetchJob) -> Result<IngestStats> {
        self.ingest(SourceKind::Api, job.source_id, &job.source_name, &job.api_base_url, job.backfill_hours)
            .await
    }

    /// Fetch candidates, classify them against the dedup window and store the new ones.
    /// RSS items start `PENDING`; aggregator items are stored `ENRICHED` with a mapped
    /// enrichment. Per-item store failures are counted, not fatal.
    async fn ingest(
        &self,
        kind: SourceKind,
        source_id: i64,
        label: &str,
        location: &str,
        backfill_hours: Option<i64>,
    ) -> Result<IngestStats> {
        let since = Utc::now() - Duration::hours(backfill_hours.unwrap_or(DEFAULT_LOOKBACK_HOURS).max(1));
        let adapter = match kind {
            SourceKind::Rss => self.sources.rss(label, location),
            SourceKind::Api => self.sources.news_api(label, location),
        };
        let items = adapter
            .fetch_candidates(since)
            .await
            .with_context(|| format!("fetching {kind} source {label}"))?;
        counter!("ingest_candidates_total", "source" => label.to_string()).increment(items.len() as u64);

        let window = self
            .store
            .dedup_window(Utc::now() - Duration::days(DEDUP_WINDOW_DAYS))
            .await
            .context("loading dedup window")?;
        let mut engine = DedupEngine::new(window);
        if kind == SourceKind::Api {
            engine = engine.with_allowlist(self.allowlist.clone());
        }

        let mut stats = IngestStats {
            fetched: items.len(),
            ..IngestStats::default()
        };
        for item in &items {
            let entry = match engine.classify(item) {
                Verdict::New(entry) => entry,
                Verdict::Duplicate(reason) => {
                    stats.duplicates += 1;
                    debug!(source = label, title = %item.title, ?reason, "duplicate candidate");
                    continue;
                }
                Verdict::Noise(reason) => {
                    stats.noise += 1;
                    debug!(source = label, title = %item.title, reason = reason.as_str(), "noise candidate");
                    continue;
                }
            };

            let article = NewArticle {
                source_id,
                url: item.url.clone(),
                url_normalized: entry.url_normalized,
                title_original: item.title.clone(),
                hash: entry.hash,
                published_at: item.published_at,
                status: ArticleStatus::Pending,
                summary: item.summary.clone(),
            };
            let inserted = match kind {
                SourceKind::Rss => self.store.insert_article(&article).await,
                SourceKind::Api => self.store.insert_enriched_article(&article, &map_api_item(item)).await,
            };
            match inserted {
                Ok(Some(id)) => {
                    stats.new_articles += 1;
                    debug!(source = label, article_id = id, title = %item.title, "new article");
                }
                Ok(None) => stats.duplicates += 1,
                Err(e) => {
                    stats.errors += 1;
                    warn!(source = label, url = %item.url, error = ?e, "failed to store candidate");
                }
            }
        }

        info!(
            source = label,
            kind = %kind,
            fetched = stats.fetched,
            new = stats.new_articles,
            duplicates = stats.duplicates,
            noise = stats.noise,
            errors = stats.errors,
            "ingest run finished"
        );
        Ok(stats)
    }

    /// `PENDING → FETCHED` on success. On failure the article becomes `FAILED`, unless the broker
    /// is going to retry the job.
    pub async fn fetch_article(&self, article_id: i64, ctx: Option<&JobContext>) -> Result<FetchOutcome> {
        let article = self
            .store
            .get_article(article_id)
            .await?
            .ok_or_else(|| anyhow!("article not found: {article_id}"))?;
        if article.status != ArticleStatus::Pending {
            debug!(article_id, status = %article.status, "article no longer pending, nothing to fetch");
            return Ok(FetchOutcome::NotPending(article.status));
        }

        match self.pages.fetch_page(&article.url).await {
            Ok(page) => {
                let chars = page.text.chars().count();
                let moved = self
                    .store
                    .mark_fetched(article_id, &page.text, page.title.as_deref())
                    .await?;
                if !moved {
                    let now = self.store.get_article(article_id).await?.map(|a| a.status);
                    return Ok(FetchOutcome::NotPending(now.unwrap_or(ArticleStatus::Failed)));
                }
                info!(article_id, extracted_chars = chars, "article fetched");
                Ok(FetchOutcome::Fetched { chars })
            }
            Err(e) => {
                let err = anyhow::Error::new(e).context(format!("fetching article {article_id}"));
                if ctx.map_or(true, |c| !c.will_retry(&err)) {
                    self.store
                        .transition(article_id, ArticleStatus::Pending, ArticleStatus::Failed)
                        .await?;
                }
                Err(err)
            }
        }
    }

    /// Enrich one `FETCHED` article. Re-running for an `ENRICHED` article is a no-op.
    pub async fn enrich_article(&self, article_id: i64) -> Result<EnrichOutcome> {
        let article = self
            .store
            .get_article(article_id)
            .await?
            .ok_or_else(|| anyhow!("article not found: {article_id}"))?;
        match article.status {
            ArticleStatus::Enriched => {
                info!(article_id, "article already enriched, skipping");
                return Ok(EnrichOutcome::AlreadyEnriched);
            }
            ArticleStatus::Fetched => {}
            other => bail!("article {article_id} not in FETCHED status: {other}"),
        }

        let gate = quality_gate(article.extracted_text.as_deref());
        if gate != Gate::Pass {
            info!(article_id, ?gate, "article text failed the quality gate, marking SKIPPED");
            self.store
                .transition(article_id, ArticleStatus::Fetched, ArticleStatus::Skipped)
                .await?;
            return Ok(EnrichOutcome::Skipped(gate));
        }

        let source = self
            .store
            .get_source(article.source_id)
            .await?
            .map(|s| s.name)
            .unwrap_or_else(|| "Unknown".to_string());
        let input = EnrichInput {
            article_id,
            title: &article.title_original,
            source: &source,
            url: &article.url,
            published_at: article.published_at,
            text: article.extracted_text.as_deref().unwrap_or_default(),
        };

        match self.enricher.enrich(&input).await {
            Ok(enrichment) => match self.store.complete_enrichment(&enrichment).await {
                Ok(()) => Ok(EnrichOutcome::Enriched),
                Err(e) => {
                    if let Err(te) = self
                        .store
                        .transition(article_id, ArticleStatus::Fetched, ArticleStatus::Failed)
                        .await
                    {
                        warn!(article_id, error = ?te, "could not mark article FAILED after store error");
                    }
                    Err(anyhow::Error::new(e).context(format!("storing enrichment for article {article_id}")))
                }
            },
            Err(e) => {
                self.store
                    .transition(article_id, ArticleStatus::Fetched, ArticleStatus::Failed)
                    .await?;
                Err(anyhow::Error::new(e).context(format!("enriching article {article_id}")))
            }
        }
    }

    pub async fn generate_digest(&self, job: &DigestJob) -> Result<Value> {
        let digest = self
            .digest
            .as_ref()
            .ok_or_else(|| anyhow!("digest generation is not configured"))?;
        let out = digest.generate(job.schedule_type, job.webhook_url.as_deref()).await?;
        Ok(json!({
            "summaryId": out.summary_id,
            "scheduleType": job.schedule_type.as_str(),
            "articleCount": out.headline_count,
            "usedFallback": out.used_fallback,
            "delivered": out.delivered,
        }))
    }

    async fn run(&self, job: &Job, ctx: &JobContext) -> Result<Value> {
        match job {
            Job::FetchRss(j) => {
                let stats = self.fetch_rss(j).await?;
                Ok(json!({ "sourceId": j.source_id, "feedUrl": j.feed_url, "stats": stats }))
            }
            Job::FetchApiNews(j) => {
                let stats = self.fetch_api(j).await?;
                Ok(json!({ "sourceId": j.source_id, "apiBaseUrl": j.api_base_url, "stats": stats }))
            }
            Job::FetchArticle(a) => match self.fetch_article(a.article_id, Some(ctx)).await? {
                FetchOutcome::Fetched { chars } => Ok(json!({ "extractedLength": chars })),
                FetchOutcome::NotPending(status) => Ok(json!({ "skipped": true, "status": status.as_str() })),
            },
            Job::EnrichArticle(a) => {
                let outcome = self.enrich_article(a.article_id).await?;
                let mut meta = json!({ "outcome": outcome.as_str() });
                if let EnrichOutcome::Skipped(Gate::TooShort { chars }) = outcome {
                    meta["textLength"] = json!(chars);
                }
                Ok(meta)
            }
            Job::GenerateDigest(d) => self.generate_digest(d).await,
        }
    }

    async fn audit(&self, entry: NewAudit) {
        if let Err(e) = self.store.record_audit(&entry).await {
            warn!(job_key = %entry.job_key, status = %entry.status, error = ?e, "failed to write job audit");
        }
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    /// Every execution leaves `STARTED` and then `COMPLETED` or `FAILED` audit rows.
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()> {
        let started_at = Utc::now();
        let base = NewAudit {
            job_type: job.job_type(),
            job_key: ctx.key.clone(),
            article_id: job.article_id(),
            status: AuditStatus::Started,
            metadata: Some(json!({ "attempt": ctx.attempt })),
            error: None,
            started_at,
            finished_at: None,
        };
        self.audit(base.clone()).await;

        let result = self.run(&job, &ctx).await;
        let finished_at = Some(Utc::now());
        match &result {
            Ok(meta) => {
                self.audit(NewAudit {
                    status: AuditStatus::Completed,
                    metadata: Some(meta.clone()),
                    finished_at,
                    ..base
                })
                .await
            }
            Err(e) => {
                self.audit(NewAudit {
                    status: AuditStatus::Failed,
                    error: Some(error_chain(e)),
                    finished_at,
                    ..base
                })
                .await
            }
        }
        result.map(|_| ())
    }
}
