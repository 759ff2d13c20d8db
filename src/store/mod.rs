//! # Article lifecycle store
//!
//! SQLite persistence for every pipeline entity:
//! - Sources (configured feeds/APIs)
//! - Articles and their status machine
//! - Enrichments (upserted by article id)
//! - Postings, JobAudits (append-only)
//! - Whale snapshots/traders (pruned to a rolling cap in the same transaction)
//! - Market summaries (digest runs)
//!
//! The store is the only mutation point for these rows. Multi-row writes that must be atomic
//! run inside one transaction.

mod models;
mod schema;

pub use models::*;
pub use schema::SCHEMA_SQL;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::dedup::WindowEntry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("json column error")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("{0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

fn to_ms(d: DateTime<Utc>) -> i64 {
    d.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_default()
}

fn opt_from_ms(v: Option<i64>) -> Option<DateTime<Utc>> {
    v.and_then(DateTime::from_timestamp_millis)
}

fn json_list(raw: Option<String>) -> StoreResult<Vec<String>> {
    match raw {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
        _ => Ok(Vec::new()),
    }
}

fn json_value(raw: Option<String>) -> StoreResult<Option<serde_json::Value>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

fn parse_enum<T: FromStr<Err = StoreError>>(raw: &str) -> StoreResult<T> {
    raw.parse()
}

const ARTICLE_COLUMNS: &str = "id, source_id, url, url_normalized, title_original, hash, published_at, status, extracted_text, summary, created_at, updated_at";

/// Database handle; cheap to clone.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to a SQLite database URL (e.g. `sqlite://cryptowire.db`) and apply the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        debug!(url, "connecting to SQLite");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database. Pinned to a single connection that never recycles, since
    /// each SQLite memory connection is its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the schema as one multi-statement script (idempotent).
    pub async fn init_schema(&self) -> StoreResult<()> {
        info!("initializing database schema");
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    // ===== Sources =====

    fn source_from_row(row: &SqliteRow) -> StoreResult<Source> {
        Ok(Source {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: parse_enum(row.try_get::<String, _>("kind")?.as_str())?,
            url: row.try_get("url")?,
            enabled: row.try_get("enabled")?,
            created_at: from_ms(row.try_get("created_at")?),
        })
    }

    pub async fn source_by_name(&self, name: &str) -> StoreResult<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::source_from_row).transpose()
    }

    pub async fn get_source(&self, id: i64) -> StoreResult<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::source_from_row).transpose()
    }

    /// Create or refresh a source by name. Changing the kind of an existing source is rejected.
    pub async fn upsert_source(&self, spec: &SourceSpec) -> StoreResult<Source> {
        if let Some(existing) = self.source_by_name(&spec.name).await? {
            if existing.kind != spec.kind {
                return Err(StoreError::InvalidValue(format!(
                    "source {} is {}; kind cannot change to {}",
                    spec.name, existing.kind, spec.kind
                )));
            }
        }
        let now = to_ms(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO sources (name, kind, url, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                url = excluded.url,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&spec.name)
        .bind(spec.kind.as_str())
        .bind(&spec.url)
        .bind(spec.enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.source_by_name(&spec.name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("source {}", spec.name)))
    }

    pub async fn set_source_enabled(&self, id: i64, enabled: bool) -> StoreResult<()> {
        sqlx::query("UPDATE sources SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(to_ms(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_sources(&self, enabled_only: bool) -> StoreResult<Vec<Source>> {
        let sql = if enabled_only {
            "SELECT * FROM sources WHERE enabled = 1 ORDER BY id"
        } else {
            "SELECT * FROM sources ORDER BY id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::source_from_row).collect()
    }

    // ===== Articles =====

    fn article_from_row(row: &SqliteRow) -> StoreResult<Article> {
        Ok(Article {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            url: row.try_get("url")?,
            url_normalized: row.try_get("url_normalized")?,
            title_original: row.try_get("title_original")?,
            hash: row.try_get("hash")?,
            published_at: opt_from_ms(row.try_get("published_at")?),
            status: parse_enum(row.try_get::<String, _>("status")?.as_str())?,
            extracted_text: row.try_get("extracted_text")?,
            summary: row.try_get("summary")?,
            created_at: from_ms(row.try_get("created_at")?),
            updated_at: from_ms(row.try_get("updated_at")?),
        })
    }

    /// Insert a new article. Returns `None` when the hash or normalized URL already exists.
    pub async fn insert_article(&self, a: &NewArticle) -> StoreResult<Option<i64>> {
        let now = to_ms(Utc::now());
        let res = sqlx::query(
            r#"
            INSERT OR IGNORE INTO articles
                (source_id, url, url_normalized, title_original, hash, published_at, status, summary, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.source_id)
        .bind(&a.url)
        .bind(&a.url_normalized)
        .bind(&a.title_original)
        .bind(&a.hash)
        .bind(a.published_at.map(to_ms))
        .bind(a.status.as_str())
        .bind(&a.summary)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok((res.rows_affected() > 0).then(|| res.last_insert_rowid()))
    }

    /// Insert an article already in `ENRICHED` state together with its enrichment.
    /// `enrichment.article_id` is ignored and replaced by the new id.
    pub async fn insert_enriched_article(
        &self,
        a: &NewArticle,
        enrichment: &NewEnrichment,
    ) -> StoreResult<Option<i64>> {
        let now = to_ms(Utc::now());
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            INSERT OR IGNORE INTO articles
                (source_id, url, url_normalized, title_original, hash, published_at, status, summary, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.source_id)
        .bind(&a.url)
        .bind(&a.url_normalized)
        .bind(&a.title_original)
        .bind(&a.hash)
        .bind(a.published_at.map(to_ms))
        .bind(ArticleStatus::Enriched.as_str())
        .bind(&a.summary)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let id = res.last_insert_rowid();
        let mut e = enrichment.clone();
        e.article_id = id;
        Self::upsert_enrichment_in(&mut tx, &e, now).await?;
        tx.commit().await?;
        Ok(Some(id))
    }

    pub async fn get_article(&self, id: i64) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::article_from_row).transpose()
    }

    /// Oldest-first batch of articles in `status`.
    pub async fn articles_by_status(&self, status: ArticleStatus, limit: i64) -> StoreResult<Vec<Article>> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::article_from_row).collect()
    }

    /// Guarded status change; returns false when the article was not in `from`.
    pub async fn transition(&self, id: i64, from: ArticleStatus, to: ArticleStatus) -> StoreResult<bool> {
        let res = sqlx::query("UPDATE articles SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(to_ms(Utc::now()))
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// `PENDING → FETCHED` with the extracted body. A page title only fills an empty title.
    pub async fn mark_fetched(&self, id: i64, text: &str, page_title: Option<&str>) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE articles SET
                status = ?,
                extracted_text = ?,
                title_original = COALESCE(NULLIF(title_original, ''), ?, title_original),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(ArticleStatus::Fetched.as_str())
        .bind(text)
        .bind(page_title)
        .bind(to_ms(Utc::now()))
        .bind(id)
        .bind(ArticleStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Dedup keys of every article ingested since `since`.
    pub async fn dedup_window(&self, since: DateTime<Utc>) -> StoreResult<Vec<WindowEntry>> {
        let rows = sqlx::query(
            "SELECT hash, url_normalized, title_original FROM articles WHERE created_at >= ? ORDER BY id",
        )
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(WindowEntry {
                    hash: r.try_get("hash")?,
                    url_normalized: r.try_get("url_normalized")?,
                    title: r.try_get("title_original")?,
                })
            })
            .collect()
    }

    /// Articles published (or ingested, when undated) since `since`, newest first.
    pub async fn cluster_candidates(&self, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<ClusterCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.title_original, a.url, a.url_normalized, a.published_at, s.name AS source
            FROM articles a JOIN sources s ON s.id = a.source_id
            WHERE COALESCE(a.published_at, a.created_at) >= ?
            ORDER BY COALESCE(a.published_at, a.created_at) DESC, a.id DESC
            LIMIT ?
            "#,
        )
        .bind(to_ms(since))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(ClusterCandidate {
                    id: r.try_get("id")?,
                    title: r.try_get("title_original")?,
                    url: r.try_get("url")?,
                    url_normalized: r.try_get("url_normalized")?,
                    published_at: opt_from_ms(r.try_get("published_at")?),
                    source: r.try_get("source")?,
                })
            })
            .collect()
    }

    // ===== Enrichments =====

    async fn upsert_enrichment_in(
        conn: &mut sqlx::SqliteConnection,
        e: &NewEnrichment,
        now: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO enrichments
                (article_id, title_th, summary_th, tags, sentiment, market_impact, sentiment_confidence,
                 cautions, must_quote, external_sentiment, santiment_metrics, llm_provider, llm_model,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(article_id) DO UPDATE SET
                title_th = excluded.title_th,
                summary_th = excluded.summary_th,
                tags = excluded.tags,
                sentiment = excluded.sentiment,
                market_impact = excluded.market_impact,
                sentiment_confidence = excluded.sentiment_confidence,
                cautions = excluded.cautions,
                must_quote = excluded.must_quote,
                external_sentiment = excluded.external_sentiment,
                santiment_metrics = excluded.santiment_metrics,
                llm_provider = excluded.llm_provider,
                llm_model = excluded.llm_model,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(e.article_id)
        .bind(&e.title_th)
        .bind(&e.summary_th)
        .bind(serde_json::to_string(&e.tags)?)
        .bind(e.sentiment.as_str())
        .bind(e.market_impact.as_str())
        .bind(e.sentiment_confidence)
        .bind(serde_json::to_string(&e.cautions)?)
        .bind(serde_json::to_string(&e.must_quote)?)
        .bind(e.external_sentiment.as_ref().map(|v| v.to_string()))
        .bind(e.santiment_metrics.as_ref().map(|v| v.to_string()))
        .bind(&e.llm_provider)
        .bind(&e.llm_model)
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert-or-replace keyed by `article_id`.
    pub async fn upsert_enrichment(&self, e: &NewEnrichment) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_enrichment_in(&mut conn, e, to_ms(Utc::now())).await
    }

    /// Upsert the enrichment and mark the article `ENRICHED` atomically.
    pub async fn complete_enrichment(&self, e: &NewEnrichment) -> StoreResult<()> {
        let now = to_ms(Utc::now());
        let mut tx = self.pool.begin().await?;
        Self::upsert_enrichment_in(&mut tx, e, now).await?;
        sqlx::query("UPDATE articles SET status = ?, updated_at = ? WHERE id = ?")
            .bind(ArticleStatus::Enriched.as_str())
            .bind(now)
            .bind(e.article_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_enrichment(&self, article_id: i64) -> StoreResult<Option<Enrichment>> {
        let row = sqlx::query("SELECT * FROM enrichments WHERE article_id = ?")
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        Ok(Some(Enrichment {
            id: r.try_get("id")?,
            data: NewEnrichment {
                article_id: r.try_get("article_id")?,
                title_th: r.try_get("title_th")?,
                summary_th: r.try_get("summary_th")?,
                tags: json_list(r.try_get("tags")?)?,
                sentiment: parse_enum(r.try_get::<String, _>("sentiment")?.as_str())?,
                market_impact: parse_enum(r.try_get::<String, _>("market_impact")?.as_str())?,
                sentiment_confidence: r.try_get("sentiment_confidence")?,
                cautions: json_list(r.try_get("cautions")?)?,
                must_quote: json_list(r.try_get("must_quote")?)?,
                external_sentiment: json_value(r.try_get("external_sentiment")?)?,
                santiment_metrics: json_value(r.try_get("santiment_metrics")?)?,
                llm_provider: r.try_get("llm_provider")?,
                llm_model: r.try_get("llm_model")?,
            },
            created_at: from_ms(r.try_get("created_at")?),
            updated_at: from_ms(r.try_get("updated_at")?),
        }))
    }

    pub async fn count_enrichments(&self, article_id: i64) -> StoreResult<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrichments WHERE article_id = ?")
            .bind(article_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ===== Postings =====

    pub async fn create_posting(&self, article_id: i64, channel: &str) -> StoreResult<i64> {
        let now = to_ms(Utc::now());
        let res = sqlx::query(
            "INSERT INTO postings (article_id, channel, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(article_id)
        .bind(channel)
        .bind(PostingStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn mark_posting_posted(&self, id: i64) -> StoreResult<()> {
        let now = to_ms(Utc::now());
        sqlx::query("UPDATE postings SET status = ?, posted_at = ?, error = NULL, updated_at = ? WHERE id = ?")
            .bind(PostingStatus::Posted.as_str())
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_posting_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query("UPDATE postings SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(PostingStatus::Failed.as_str())
            .bind(error)
            .bind(to_ms(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn postings_for_article(&self, article_id: i64) -> StoreResult<Vec<Posting>> {
        let rows = sqlx::query("SELECT * FROM postings WHERE article_id = ? ORDER BY id")
            .bind(article_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(Posting {
                    id: r.try_get("id")?,
                    article_id: r.try_get("article_id")?,
                    channel: r.try_get("channel")?,
                    status: parse_enum(r.try_get::<String, _>("status")?.as_str())?,
                    posted_at: opt_from_ms(r.try_get("posted_at")?),
                    error: r.try_get("error")?,
                    created_at: from_ms(r.try_get("created_at")?),
                })
            })
            .collect()
    }

    // ===== Job audits =====

    pub async fn record_audit(&self, a: &NewAudit) -> StoreResult<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO job_audits (job_type, job_key, article_id, status, metadata, error, started_at, finished_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.job_type.as_str())
        .bind(&a.job_key)
        .bind(a.article_id)
        .bind(a.status.as_str())
        .bind(a.metadata.as_ref().map(|v| v.to_string()))
        .bind(&a.error)
        .bind(to_ms(a.started_at))
        .bind(a.finished_at.map(to_ms))
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    fn audit_from_row(r: &SqliteRow) -> StoreResult<JobAudit> {
        Ok(JobAudit {
            id: r.try_get("id")?,
            job_type: parse_enum(r.try_get::<String, _>("job_type")?.as_str())?,
            job_key: r.try_get("job_key")?,
            article_id: r.try_get("article_id")?,
            status: parse_enum(r.try_get::<String, _>("status")?.as_str())?,
            metadata: json_value(r.try_get("metadata")?)?,
            error: r.try_get("error")?,
            started_at: from_ms(r.try_get("started_at")?),
            finished_at: opt_from_ms(r.try_get("finished_at")?),
        })
    }

    pub async fn audits_for_key(&self, job_key: &str) -> StoreResult<Vec<JobAudit>> {
        let rows = sqlx::query("SELECT * FROM job_audits WHERE job_key = ? ORDER BY id")
            .bind(job_key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::audit_from_row).collect()
    }

    pub async fn audits_for_article(&self, article_id: i64) -> StoreResult<Vec<JobAudit>> {
        let rows = sqlx::query("SELECT * FROM job_audits WHERE article_id = ? ORDER BY id")
            .bind(article_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::audit_from_row).collect()
    }

    // ===== Whale snapshots =====

    /// Insert a snapshot with its traders, then prune everything but the newest `retain`
    /// snapshots, all in one transaction.
    pub async fn persist_whale_snapshot(&self, s: &NewWhaleSnapshot, retain: i64) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        let snapshot_id = sqlx::query(
            r#"
            INSERT INTO whale_snapshots (scan_time, timeframe, risk_profile, candidates, selected_count, raw_payload)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_ms(s.scan_time))
        .bind(&s.timeframe)
        .bind(&s.risk_profile)
        .bind(s.candidates)
        .bind(s.traders.len() as i64)
        .bind(&s.raw_payload)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for t in &s.traders {
            sqlx::query(
                r#"
                INSERT INTO whale_traders
                    (snapshot_id, wallet_address, rank, score, allocation_pct, consistency, win_rate, roi, pnl,
                     pnl_rank, hold_time_hours, max_drawdown_pct)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot_id)
            .bind(&t.wallet_address)
            .bind(t.rank)
            .bind(t.score)
            .bind(t.allocation_pct)
            .bind(&t.consistency)
            .bind(t.win_rate)
            .bind(t.roi)
            .bind(t.pnl)
            .bind(t.pnl_rank)
            .bind(t.hold_time_hours)
            .bind(t.max_drawdown_pct)
            .execute(&mut *tx)
            .await?;
        }

        const KEEP: &str = "SELECT id FROM whale_snapshots ORDER BY scan_time DESC, id DESC LIMIT ?";
        sqlx::query(&format!("DELETE FROM whale_traders WHERE snapshot_id NOT IN ({KEEP})"))
            .bind(retain)
            .execute(&mut *tx)
            .await?;
        let pruned = sqlx::query(&format!("DELETE FROM whale_snapshots WHERE id NOT IN ({KEEP})"))
            .bind(retain)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if pruned > 0 {
            debug!(pruned, "pruned old whale snapshots");
        }
        Ok(snapshot_id)
    }

    pub async fn count_whale_snapshots(&self) -> StoreResult<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM whale_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn latest_whale_snapshot(&self) -> StoreResult<Option<WhaleSnapshot>> {
        let row = sqlx::query("SELECT * FROM whale_snapshots ORDER BY scan_time DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let id: i64 = r.try_get("id")?;
        let traders = sqlx::query("SELECT * FROM whale_traders WHERE snapshot_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|t| {
                Ok(WhaleTraderRow {
                    wallet_address: t.try_get("wallet_address")?,
                    rank: t.try_get("rank")?,
                    score: t.try_get("score")?,
                    allocation_pct: t.try_get("allocation_pct")?,
                    consistency: t.try_get("consistency")?,
                    win_rate: t.try_get("win_rate")?,
                    roi: t.try_get("roi")?,
                    pnl: t.try_get("pnl")?,
                    pnl_rank: t.try_get("pnl_rank")?,
                    hold_time_hours: t.try_get("hold_time_hours")?,
                    max_drawdown_pct: t.try_get("max_drawdown_pct")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Some(WhaleSnapshot {
            id,
            scan_time: from_ms(r.try_get("scan_time")?),
            timeframe: r.try_get("timeframe")?,
            risk_profile: r.try_get("risk_profile")?,
            candidates: r.try_get("candidates")?,
            selected_count: r.try_get("selected_count")?,
            traders,
        }))
    }

    // ===== Market summaries =====

    /// Headlines for a digest: HIGH/MEDIUM impact articles ingested since `since`.
    pub async fn digest_headlines(&self, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Headline>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.title_original, a.url, s.name AS source, e.sentiment, e.market_impact,
                   COALESCE(e.summary_th, a.summary) AS summary, a.published_at
            FROM articles a
            JOIN sources s ON s.id = a.source_id
            JOIN enrichments e ON e.article_id = a.id
            WHERE a.status IN ('FETCHED', 'ENRICHED')
              AND e.market_impact IN ('HIGH', 'MEDIUM')
              AND a.created_at >= ?
            ORDER BY CASE e.market_impact WHEN 'HIGH' THEN 0 ELSE 1 END,
                     COALESCE(a.published_at, a.created_at) DESC
            LIMIT ?
            "#,
        )
        .bind(to_ms(since))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(Headline {
                    article_id: r.try_get("id")?,
                    title: r.try_get("title_original")?,
                    url: r.try_get("url")?,
                    source: r.try_get("source")?,
                    sentiment: Some(parse_enum(r.try_get::<String, _>("sentiment")?.as_str())?),
                    market_impact: Some(parse_enum(r.try_get::<String, _>("market_impact")?.as_str())?),
                    summary: r.try_get("summary")?,
                    published_at: opt_from_ms(r.try_get("published_at")?),
                })
            })
            .collect()
    }

    /// Creation time of the newest summary (optionally of one schedule type).
    pub async fn last_summary_at(&self, schedule: Option<ScheduleType>) -> StoreResult<Option<DateTime<Utc>>> {
        let v: Option<i64> = match schedule {
            Some(s) => sqlx::query_scalar("SELECT MAX(created_at) FROM market_summaries WHERE schedule_type = ?")
                .bind(s.as_str())
                .fetch_one(&self.pool)
                .await?,
            None => sqlx::query_scalar("SELECT MAX(created_at) FROM market_summaries")
                .fetch_one(&self.pool)
                .await?,
        };
        Ok(opt_from_ms(v))
    }

    pub async fn insert_summary(&self, s: &NewMarketSummary) -> StoreResult<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO market_summaries (schedule_type, summary_text, section_title, headlines, prices, llm_model, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.schedule_type.as_str())
        .bind(&s.summary_text)
        .bind(&s.section_title)
        .bind(serde_json::to_string(&s.headlines)?)
        .bind(serde_json::to_string(&s.prices)?)
        .bind(&s.llm_model)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Record the single delivery attempt of a summary.
    pub async fn record_summary_delivery(&self, id: i64, outcome: Result<(), String>) -> StoreResult<()> {
        match outcome {
            Ok(()) => {
                sqlx::query(
                    "UPDATE market_summaries SET discord_posted = 1, discord_posted_at = ?, discord_error = NULL WHERE id = ?",
                )
                .bind(to_ms(Utc::now()))
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            Err(e) => {
                sqlx::query("UPDATE market_summaries SET discord_posted = 0, discord_error = ? WHERE id = ?")
                    .bind(e)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get_summary(&self, id: i64) -> StoreResult<Option<MarketSummary>> {
        let row = sqlx::query("SELECT * FROM market_summaries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let headlines: Vec<Headline> = serde_json::from_str(&r.try_get::<String, _>("headlines")?)?;
        let prices: Vec<PriceQuote> = serde_json::from_str(&r.try_get::<String, _>("prices")?)?;
        Ok(Some(MarketSummary {
            id: r.try_get("id")?,
            schedule_type: parse_enum(r.try_get::<String, _>("schedule_type")?.as_str())?,
            summary_text: r.try_get("summary_text")?,
            section_title: r.try_get("section_title")?,
            headlines,
            prices,
            llm_model: r.try_get("llm_model")?,
            discord_posted: r.try_get("discord_posted")?,
            discord_posted_at: opt_from_ms(r.try_get("discord_posted_at")?),
            discord_error: r.try_get("discord_error")?,
            created_at: from_ms(r.try_get("created_at")?),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (Store, Source) {
        let store = Store::in_memory().await.unwrap();
        let src = store
            .upsert_source(&SourceSpec {
                name: "CoinDesk".into(),
                kind: SourceKind::Rss,
                url: "https://coindesk.com/feed".into(),
                enabled: true,
            })
            .await
            .unwrap();
        (store, src)
    }

    fn new_article(source_id: i64, n: u32) -> NewArticle {
        NewArticle {
            source_id,
            url: format!("https://coindesk.com/a/{n}"),
            url_normalized: format!("https://coindesk.com/a/{n}"),
            title_original: format!("Story number {n} about markets"),
            hash: format!("hash-{n}"),
            published_at: None,
            status: ArticleStatus::Pending,
            summary: None,
        }
    }

    #[tokio::test]
    async fn opens_on_disk_and_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("wire.db").display());
        let disk = Store::connect(&url).await.unwrap();
        // Re-applying the schema is a no-op.
        disk.init_schema().await.unwrap();
        assert!(disk.list_sources(false).await.unwrap().is_empty());
        drop(disk);
        let reopened = Store::connect(&url).await.unwrap();
        assert!(reopened.get_article(1).await.unwrap().is_none());

        let mem = Store::in_memory().await.unwrap();
        mem.init_schema().await.unwrap();
        assert_eq!(mem.count_whale_snapshots().await.unwrap(), 0);
        assert!(mem.last_summary_at(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn source_kind_is_immutable() {
        let (store, src) = seeded().await;
        let err = store
            .upsert_source(&SourceSpec {
                name: "CoinDesk".into(),
                kind: SourceKind::Api,
                url: "https://x".into(),
                enabled: true,
            })
            .await;
        assert!(matches!(err, Err(StoreError::InvalidValue(_))));

        store.set_source_enabled(src.id, false).await.unwrap();
        assert!(store.list_sources(true).await.unwrap().is_empty());
        assert_eq!(store.list_sources(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_ignores_dedup_key_conflicts() {
        let (store, src) = seeded().await;
        let a = new_article(src.id, 1);
        assert!(store.insert_article(&a).await.unwrap().is_some());
        assert!(store.insert_article(&a).await.unwrap().is_none());
        let mut same_url = new_article(src.id, 2);
        same_url.url_normalized = a.url_normalized.clone();
        assert!(store.insert_article(&same_url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_batch_is_oldest_first_and_transitions_are_guarded() {
        let (store, src) = seeded().await;
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(store.insert_article(&new_article(src.id, n)).await.unwrap().unwrap());
        }
        let batch = store.articles_by_status(ArticleStatus::Pending, 3).await.unwrap();
        assert_eq!(batch.iter().map(|a| a.id).collect::<Vec<_>>(), ids[..3].to_vec());

        assert!(store.mark_fetched(ids[0], "body", None).await.unwrap());
        assert!(!store.mark_fetched(ids[0], "body again", None).await.unwrap());
        assert!(!store
            .transition(ids[1], ArticleStatus::Fetched, ArticleStatus::Enriched)
            .await
            .unwrap());
        let a = store.get_article(ids[0]).await.unwrap().unwrap();
        assert_eq!(a.status, ArticleStatus::Fetched);
        assert_eq!(a.extracted_text.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn postings_lifecycle() {
        let (store, src) = seeded().await;
        let id = store.insert_article(&new_article(src.id, 1)).await.unwrap().unwrap();
        let p1 = store.create_posting(id, "discord").await.unwrap();
        let p2 = store.create_posting(id, "telegram").await.unwrap();
        store.mark_posting_posted(p1).await.unwrap();
        store.mark_posting_failed(p2, "429").await.unwrap();
        let ps = store.postings_for_article(id).await.unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[0].status, PostingStatus::Posted);
        assert!(ps[0].posted_at.is_some());
        assert_eq!(ps[1].status, PostingStatus::Failed);
        assert_eq!(ps[1].error.as_deref(), Some("429"));
    }

    #[tokio::test]
    async fn audits_are_append_only() {
        let (store, _) = seeded().await;
        let started = Utc::now();
        for status in [AuditStatus::Started, AuditStatus::Completed] {
            store
                .record_audit(&NewAudit {
                    job_type: JobType::FetchRss,
                    job_key: "rss-1-0".into(),
                    article_id: None,
                    status,
                    metadata: Some(serde_json::json!({"created": 3})),
                    error: None,
                    started_at: started,
                    finished_at: None,
                })
                .await
                .unwrap();
        }
        let audits = store.audits_for_key("rss-1-0").await.unwrap();
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[1].status, AuditStatus::Completed);
        assert_eq!(audits[1].metadata.as_ref().unwrap()["created"], 3);
    }
}
