//! Persisted entities and their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::StoreError;

/// Declares a string-backed enum with `as_str`, `Display` and case-insensitive `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(if s.eq_ignore_ascii_case($text) {
                    return Ok($name::$variant);
                })+
                Err(StoreError::InvalidValue(format!(
                    "unknown {} value: {s}",
                    stringify!($name)
                )))
            }
        }
    };
}

string_enum!(
    /// Kind of a configured origin; fixed once the source row exists.
    SourceKind { Rss => "RSS", Api => "API" }
);

string_enum!(
    /// Article lifecycle.
    ///
    /// `PENDING → FETCHED → ENRICHED`, with `FAILED` and `SKIPPED` as terminal side exits.
    ArticleStatus {
        Pending => "PENDING",
        Fetched => "FETCHED",
        Enriched => "ENRICHED",
        Failed => "FAILED",
        Skipped => "SKIPPED",
    }
);

string_enum!(Sentiment { Bullish => "BULLISH", Bearish => "BEARISH", Neutral => "NEUTRAL" });

string_enum!(MarketImpact { High => "HIGH", Medium => "MEDIUM", Low => "LOW" });

string_enum!(PostingStatus { Pending => "PENDING", Posted => "POSTED", Failed => "FAILED" });

string_enum!(AuditStatus { Started => "STARTED", Completed => "COMPLETED", Failed => "FAILED" });

string_enum!(
    JobType {
        FetchRss => "FETCH_RSS",
        FetchApiNews => "FETCH_API_NEWS",
        FetchArticle => "FETCH_ARTICLE",
        EnrichArticle => "ENRICH_ARTICLE",
        GenerateDigest => "GENERATE_DIGEST",
    }
);

string_enum!(ScheduleType { Morning => "morning", Evening => "evening" });

impl ArticleStatus {
    /// No automated job moves an article out of these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArticleStatus::Enriched | ArticleStatus::Failed | ArticleStatus::Skipped
        )
    }
}

impl Sentiment {
    /// Lenient parse of provider/LLM labels (`bullish`, `Positive`, ...); unknown → neutral.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "bullish" | "positive" => Sentiment::Bullish,
            "bearish" | "negative" => Sentiment::Bearish,
            _ => Sentiment::Neutral,
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            Sentiment::Bullish => 1.0,
            Sentiment::Bearish => -1.0,
            Sentiment::Neutral => 0.0,
        }
    }
}

impl MarketImpact {
    /// Lenient parse; unknown → low.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => MarketImpact::High,
            "medium" | "med" => MarketImpact::Medium,
            _ => MarketImpact::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceSpec {
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub url_normalized: String,
    pub title_original: String,
    pub hash: String,
    pub published_at: Option<DateTime<Utc>>,
    pub status: ArticleStatus,
    pub extracted_text: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub source_id: i64,
    pub url: String,
    pub url_normalized: String,
    pub title_original: String,
    pub hash: String,
    pub published_at: Option<DateTime<Utc>>,
    pub status: ArticleStatus,
    pub summary: Option<String>,
}

/// Enrichment payload; `article_id` is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnrichment {
    pub article_id: i64,
    pub title_th: Option<String>,
    pub summary_th: Option<String>,
    pub tags: Vec<String>,
    pub sentiment: Sentiment,
    pub market_impact: MarketImpact,
    pub sentiment_confidence: Option<f64>,
    pub cautions: Vec<String>,
    pub must_quote: Vec<String>,
    pub external_sentiment: Option<serde_json::Value>,
    pub santiment_metrics: Option<serde_json::Value>,
    pub llm_provider: String,
    pub llm_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrichment {
    pub id: i64,
    #[serde(flatten)]
    pub data: NewEnrichment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Posting {
    pub id: i64,
    pub article_id: i64,
    pub channel: String,
    pub status: PostingStatus,
    pub posted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAudit {
    pub job_type: JobType,
    pub job_key: String,
    pub article_id: Option<i64>,
    pub status: AuditStatus,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobAudit {
    pub id: i64,
    pub job_type: JobType,
    pub job_key: String,
    pub article_id: Option<i64>,
    pub status: AuditStatus,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One selected trader of a whale snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhaleTraderRow {
    pub wallet_address: String,
    pub rank: i64,
    pub score: f64,
    pub allocation_pct: Option<f64>,
    pub consistency: Option<String>,
    pub win_rate: Option<f64>,
    pub roi: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_rank: Option<f64>,
    pub hold_time_hours: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWhaleSnapshot {
    pub scan_time: DateTime<Utc>,
    pub timeframe: String,
    pub risk_profile: String,
    pub candidates: i64,
    pub raw_payload: Option<String>,
    pub traders: Vec<WhaleTraderRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WhaleSnapshot {
    pub id: i64,
    pub scan_time: DateTime<Utc>,
    pub timeframe: String,
    pub risk_profile: String,
    pub candidates: i64,
    pub selected_count: i64,
    pub traders: Vec<WhaleTraderRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub article_id: i64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub sentiment: Option<Sentiment>,
    pub market_impact: Option<MarketImpact>,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub usd: f64,
    pub change_24h_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMarketSummary {
    pub schedule_type: ScheduleType,
    pub summary_text: String,
    pub section_title: Option<String>,
    pub headlines: Vec<Headline>,
    pub prices: Vec<PriceQuote>,
    pub llm_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSummary {
    pub id: i64,
    pub schedule_type: ScheduleType,
    pub summary_text: String,
    pub section_title: Option<String>,
    pub headlines: Vec<Headline>,
    pub prices: Vec<PriceQuote>,
    pub llm_model: Option<String>,
    pub discord_posted: bool,
    pub discord_posted_at: Option<DateTime<Utc>>,
    pub discord_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Minimal article view for duplicate-story clustering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterCandidate {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub url_normalized: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            ArticleStatus::Pending,
            ArticleStatus::Fetched,
            ArticleStatus::Enriched,
            ArticleStatus::Failed,
            ArticleStatus::Skipped,
        ] {
            assert_eq!(s.as_str().parse::<ArticleStatus>().unwrap(), s);
        }
        assert!("DONE".parse::<ArticleStatus>().is_err());
    }

    #[test]
    fn lenient_labels() {
        assert_eq!(Sentiment::from_label("Positive"), Sentiment::Bullish);
        assert_eq!(Sentiment::from_label("bearish "), Sentiment::Bearish);
        assert_eq!(Sentiment::from_label("mixed"), Sentiment::Neutral);
        assert_eq!(MarketImpact::from_label("HIGH"), MarketImpact::High);
        assert_eq!(MarketImpact::from_label("?"), MarketImpact::Low);
        assert!(ArticleStatus::Skipped.is_terminal());
        assert!(!ArticleStatus::Fetched.is_terminal());
    }
}
