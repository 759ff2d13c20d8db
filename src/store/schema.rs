//! SQLite schema. Timestamps are unix milliseconds; JSON columns hold serialized arrays/objects.

pub const SCHEMA_SQL: &str = r#"
-- Sources: configured feeds/APIs. kind never changes, rows are disabled instead of deleted
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    url TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Articles: hash and url_normalized are global dedup keys
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    url TEXT NOT NULL,
    url_normalized TEXT NOT NULL UNIQUE,
    title_original TEXT NOT NULL,
    hash TEXT NOT NULL UNIQUE,
    published_at INTEGER,
    status TEXT NOT NULL,
    extracted_text TEXT,
    summary TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_articles_status_created ON articles(status, created_at, id);
CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published_at);
CREATE INDEX IF NOT EXISTS idx_articles_created ON articles(created_at);

-- Enrichments: zero or one per article
CREATE TABLE IF NOT EXISTS enrichments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id INTEGER NOT NULL UNIQUE REFERENCES articles(id),
    title_th TEXT,
    summary_th TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    sentiment TEXT NOT NULL,
    market_impact TEXT NOT NULL,
    sentiment_confidence REAL,
    cautions TEXT NOT NULL DEFAULT '[]',
    must_quote TEXT NOT NULL DEFAULT '[]',
    external_sentiment TEXT,
    santiment_metrics TEXT,
    llm_provider TEXT NOT NULL,
    llm_model TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Postings: one per (article, channel) delivery attempt record
CREATE TABLE IF NOT EXISTS postings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id INTEGER NOT NULL REFERENCES articles(id),
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    posted_at INTEGER,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_postings_article ON postings(article_id);

-- Job audits: append-only
CREATE TABLE IF NOT EXISTS job_audits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    job_key TEXT NOT NULL,
    article_id INTEGER,
    status TEXT NOT NULL,
    metadata TEXT,
    error TEXT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_audits_key ON job_audits(job_key);
CREATE INDEX IF NOT EXISTS idx_job_audits_article ON job_audits(article_id);

-- Whale snapshots and their selected traders
CREATE TABLE IF NOT EXISTS whale_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_time INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    risk_profile TEXT NOT NULL,
    candidates INTEGER NOT NULL,
    selected_count INTEGER NOT NULL,
    raw_payload TEXT
);
CREATE TABLE IF NOT EXISTS whale_traders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES whale_snapshots(id) ON DELETE CASCADE,
    wallet_address TEXT NOT NULL,
    rank INTEGER NOT NULL,
    score REAL NOT NULL,
    allocation_pct REAL,
    consistency TEXT,
    win_rate REAL,
    roi REAL,
    pnl REAL,
    pnl_rank REAL,
    hold_time_hours REAL,
    max_drawdown_pct REAL
);
CREATE INDEX IF NOT EXISTS idx_whale_traders_snapshot ON whale_traders(snapshot_id);

-- Digest runs
CREATE TABLE IF NOT EXISTS market_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_type TEXT NOT NULL,
    summary_text TEXT NOT NULL,
    section_title TEXT,
    headlines TEXT NOT NULL DEFAULT '[]',
    prices TEXT NOT NULL DEFAULT '[]',
    llm_model TEXT,
    discord_posted INTEGER NOT NULL DEFAULT 0,
    discord_posted_at INTEGER,
    discord_error TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_market_summaries_created ON market_summaries(schedule_type, created_at);
"#;
