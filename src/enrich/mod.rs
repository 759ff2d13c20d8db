//! # Enrichment orchestrator
//!
//! Turns a fetched article into an [`NewEnrichment`]:
//! 1. quality gate (non-empty, at least [`MIN_TEXT_CHARS`]);
//! 2. one LLM call (errors propagate; unusable output falls back to a minimal enrichment);
//! 3. best-effort augmentation fanned out concurrently: external sentiment for the primary
//!    ticker and on-chain metrics for up to [`MAX_METRIC_SLUGS`] tokens. Each side call resolves
//!    to an [`Augment`] so a failing provider only drops its own contribution.

pub mod llm;
pub mod mapper;
pub mod onchain;
pub mod parse;
pub mod sentiment;
pub mod tags;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::ingest::types::FetchError;
use crate::store::NewEnrichment;
use llm::{CompletionOptions, DynLlm, LlmError};
use onchain::{MetricsProvider, OnchainMetrics};
use sentiment::{aggregate, ProviderSentiment, SentimentProvider};

pub const MIN_TEXT_CHARS: usize = 200;
pub const MAX_PROMPT_CHARS: usize = 4_000;
pub const MAX_METRIC_SLUGS: usize = 3;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "enrich_augment_total",
            "Best-effort enrichment side calls by kind and outcome."
        );
    });
}

/// Quality-gate verdict for extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Pass,
    Empty,
    TooShort { chars: usize },
}

pub fn quality_gate(text: Option<&str>) -> Gate {
    let t = text.map(str::trim).unwrap_or("");
    if t.is_empty() {
        return Gate::Empty;
    }
    let chars = t.chars().count();
    if chars < MIN_TEXT_CHARS {
        Gate::TooShort { chars }
    } else {
        Gate::Pass
    }
}

/// Outcome of one best-effort side call.
#[derive(Debug, Clone, PartialEq)]
pub enum Augment<T> {
    Present(T),
    Absent,
    Failed(String),
}

impl<T> Augment<T> {
    fn from_result(r: Result<Option<T>, FetchError>) -> Self {
        match r {
            Ok(Some(v)) => Augment::Present(v),
            Ok(None) => Augment::Absent,
            Err(e) => Augment::Failed(e.to_string()),
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Augment::Present(_) => "present",
            Augment::Absent => "absent",
            Augment::Failed(_) => "failed",
        }
    }

    pub fn into_present(self) -> Option<T> {
        match self {
            Augment::Present(v) => Some(v),
            _ => None,
        }
    }
}

/// Article fields the prompt needs.
#[derive(Debug, Clone)]
pub struct EnrichInput<'a> {
    pub article_id: i64,
    pub title: &'a str,
    pub source: &'a str,
    pub url: &'a str,
    pub published_at: Option<DateTime<Utc>>,
    pub text: &'a str,
}

const ENRICHMENT_PROMPT: &str = r#"Analyze the crypto article and return JSON only.
Rules: Thai only (tags in English), use ONLY the article, no speculation, add cautions if uncertain.
Tags: choose 1-5 from {VOCABULARY} (you may add 1-2 custom).

ARTICLE:
{ARTICLE_TEXT}

TITLE: {ARTICLE_TITLE}
SOURCE: {SOURCE_NAME}
PUBLISHED: {PUBLISHED_AT}

JSON schema:
{
  "title_th": "Thai headline, <=90 chars",
  "summary_th": "Thai summary, 3-5 sentences",
  "tags": ["..."],
  "sentiment": "bullish|bearish|neutral",
  "market_impact": "high|medium|low",
  "cautions": ["Thai, if needed"],
  "must_quote": ["<=15 words, if needed"]
}"#;

pub fn build_prompt(input: &EnrichInput<'_>) -> String {
    let text: String = input.text.chars().take(MAX_PROMPT_CHARS).collect();
    let published = input
        .published_at
        .map(|p| p.to_rfc3339())
        .unwrap_or_else(|| "Unknown".to_string());
    ENRICHMENT_PROMPT
        .replace("{VOCABULARY}", &tags::TAG_VOCABULARY.join(", "))
        .replace("{ARTICLE_TEXT}", &text)
        .replace("{ARTICLE_TITLE}", input.title)
        .replace("{SOURCE_NAME}", input.source)
        .replace("{PUBLISHED_AT}", &published)
}

pub struct Enricher {
    llm: DynLlm,
    sentiment: Vec<Arc<dyn SentimentProvider>>,
    metrics: Option<Arc<dyn MetricsProvider>>,
    options: CompletionOptions,
}

impl Enricher {
    pub fn new(llm: DynLlm) -> Self {
        ensure_metrics_described();
        Self {
            llm,
            sentiment: Vec::new(),
            metrics: None,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_sentiment_provider(mut self, p: Arc<dyn SentimentProvider>) -> Self {
        self.sentiment.push(p);
        self
    }

    pub fn with_metrics_provider(mut self, p: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = Some(p);
        self
    }

    pub fn llm(&self) -> &DynLlm {
        &self.llm
    }

    async fn external_sentiment(&self, ticker: Option<&str>) -> Vec<Augment<ProviderSentiment>> {
        let Some(symbol) = ticker else {
            return Vec::new();
        };
        join_all(self.sentiment.iter().map(|p| async move {
            let out = Augment::from_result(p.fetch_sentiment(symbol).await);
            if let Augment::Failed(e) = &out {
                warn!(provider = p.name(), symbol, error = %e, "sentiment provider failed");
            }
            counter!("enrich_augment_total", "kind" => "sentiment", "outcome" => out.outcome()).increment(1);
            out
        }))
        .await
    }

    async fn onchain_metrics(&self, slugs: &[&'static str]) -> Vec<Augment<OnchainMetrics>> {
        let Some(provider) = &self.metrics else {
            return Vec::new();
        };
        join_all(slugs.iter().map(|slug| async move {
            let out = Augment::from_result(provider.fetch_metrics(slug).await);
            if let Augment::Failed(e) = &out {
                warn!(provider = provider.name(), slug, error = %e, "on-chain metrics failed");
            }
            counter!("enrich_augment_total", "kind" => "onchain", "outcome" => out.outcome()).increment(1);
            out
        }))
        .await
    }

    /// Enrich one article. Only the LLM call itself can fail.
    pub async fn enrich(&self, input: &EnrichInput<'_>) -> Result<NewEnrichment, LlmError> {
        let prompt = build_prompt(input);
        debug!(article_id = input.article_id, prompt_chars = prompt.len(), "sending article to LLM");
        let response = self.llm.complete(&prompt, self.options).await?;

        let parsed = match parse::parse_enrichment(&response) {
            Ok(p) => p,
            Err(reason) => {
                warn!(article_id = input.article_id, %reason, "unusable LLM output, using fallback enrichment");
                parse::fallback_enrichment(input.title, input.text)
            }
        };

        let ticker = tags::primary_ticker(&parsed.tags);
        let slugs = tags::metric_slugs(&parsed.tags, MAX_METRIC_SLUGS);
        let (sentiments, metrics) = tokio::join!(self.external_sentiment(ticker), self.onchain_metrics(&slugs));

        let external: Vec<ProviderSentiment> = sentiments.into_iter().filter_map(Augment::into_present).collect();
        let agg = aggregate(parsed.sentiment(), &external);

        let metric_map: Map<String, Value> = metrics
            .into_iter()
            .filter_map(Augment::into_present)
            .filter_map(|m| serde_json::to_value(&m).ok().map(|v| (m.slug.clone(), v)))
            .collect();

        info!(
            article_id = input.article_id,
            sentiment = %agg.sentiment,
            confidence = agg.confidence,
            external = external.len(),
            metrics = metric_map.len(),
            "article enriched"
        );

        Ok(NewEnrichment {
            article_id: input.article_id,
            title_th: Some(parsed.title_th.clone()),
            summary_th: Some(parsed.summary_th.clone()),
            tags: parsed.tags.clone(),
            sentiment: agg.sentiment,
            market_impact: parsed.market_impact(),
            sentiment_confidence: Some(agg.confidence),
            cautions: parsed.cautions.clone(),
            must_quote: parsed.must_quote.clone(),
            external_sentiment: (!external.is_empty())
                .then(|| serde_json::to_value(&agg).ok())
                .flatten(),
            santiment_metrics: (!metric_map.is_empty()).then_some(Value::Object(metric_map)),
            llm_provider: self.llm.name().to_string(),
            llm_model: Some(self.llm.model().to_string()),
        })
    }
}
