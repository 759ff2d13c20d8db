//! # Market digest
//!
//! Twice-daily summary of HIGH/MEDIUM impact headlines:
//! 1. cutoff = newest stored summary, or 14 hours back when none exists;
//! 2. best-effort price snapshot;
//! 3. one LLM call returning `{market_context, section_title}`, with a templated fallback on
//!    any failure so a digest is always produced;
//! 4. the summary row is stored, then optionally delivered as a webhook embed and the delivery
//!    outcome recorded on the row.

pub mod prices;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::enrich::llm::{CompletionOptions, DynLlm};
use crate::enrich::parse::parse_json_response;
use crate::notify::{DiscordWebhook, Embed, EmbedField, EmbedFooter};
use crate::store::{Headline, NewMarketSummary, PriceQuote, ScheduleType, Store};
use prices::{format_change, format_price, PriceSource};

pub const EMBED_COLOR: u32 = 0x00E5CC;
pub const FALLBACK_LOOKBACK_HOURS: i64 = 14;
pub const HEADLINE_LIMIT: i64 = 50;
const PROMPT_HEADLINES: usize = 30;
const EMBED_HEADLINES: usize = 15;
const DESCRIPTION_LIMIT: usize = 1_500;
const CHUNK_LIMIT: usize = 1_000;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("digest_runs_total", "Digest generations by text source (llm/fallback).");
    });
}

fn period_th(schedule: ScheduleType) -> &'static str {
    match schedule {
        ScheduleType::Morning => "เช้า",
        ScheduleType::Evening => "เย็น",
    }
}

/// Digest text as produced by the model (or the fallback).
#[derive(Debug, Clone, PartialEq)]
pub struct DigestText {
    pub market_context: String,
    pub section_title: String,
}

pub fn fallback_text(schedule: ScheduleType, headline_count: usize) -> DigestText {
    DigestText {
        market_context: format!(
            "📊 สรุปข่าวคริปโตรอบ{} — มีข่าว {} ข่าวในช่วง 12 ชั่วโมงที่ผ่านมา",
            period_th(schedule),
            headline_count
        ),
        section_title: format!("สรุปตลาดคริปโต {}", period_th(schedule)),
    }
}

/// `None` when the completion has no usable `market_context`.
pub fn parse_digest_response(text: &str) -> Option<DigestText> {
    let v: Value = parse_json_response(text).ok()?;
    let context = v.get("market_context")?.as_str()?.trim();
    if context.is_empty() {
        return None;
    }
    let title = v
        .get("section_title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("สรุปตลาดคริปโต");
    Some(DigestText {
        market_context: context.to_string(),
        section_title: title.to_string(),
    })
}

pub fn build_prompt(schedule: ScheduleType, headlines: &[Headline], prices: &[PriceQuote], local_now: DateTime<FixedOffset>) -> String {
    let period = match schedule {
        ScheduleType::Morning => "morning (07:00)",
        ScheduleType::Evening => "evening (19:00)",
    };
    let list = headlines
        .iter()
        .take(PROMPT_HEADLINES)
        .enumerate()
        .map(|(i, h)| format!("{}. \"{}\" — {}", i + 1, h.title, h.source))
        .collect::<Vec<_>>()
        .join("\n");
    let market = prices
        .iter()
        .map(|p| {
            format!(
                "- {}: {} ({})",
                p.symbol,
                format_price(p.usd),
                p.change_24h_pct.map(format_change).unwrap_or_else(|| "n/a".into())
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a senior Thai crypto analyst writing the {period} market outlook for {date}.
Your text is shown ABOVE a price table and a headline list, so do not repeat prices or list headlines.
The headlines are pre-filtered to HIGH and MEDIUM impact; build the narrative around the HIGH ones.

Market data (reference only, do not quote):
{market}

Headlines ({count} since the last summary):
{list}

Respond ONLY with JSON:
{{
  "market_context": "2-3 paragraphs in Thai; English only for crypto jargon and proper names; no trading advice",
  "section_title": "punchy Thai title, max 50 chars, no emoji"
}}"#,
        date = local_now.format("%Y-%m-%d"),
        market = if market.is_empty() { "(unavailable)".to_string() } else { market },
        count = headlines.len(),
        list = if list.is_empty() { "(No major headlines in this period)".to_string() } else { list },
    )
}

/// Cut to `limit` characters at a word boundary and mark the cut with `...`.
pub fn truncate_description(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    static TAIL: OnceCell<Regex> = OnceCell::new();
    let tail = TAIL.get_or_init(|| Regex::new(r"\s+\S*$").unwrap());
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", tail.replace(&cut, ""))
}

/// Headline lines grouped into field values below [`CHUNK_LIMIT`] characters.
pub fn headline_chunks(headlines: &[Headline]) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for h in headlines.iter().take(EMBED_HEADLINES) {
        let title: String = h.title.chars().take(80).collect();
        let line = format!("• [{title}]({}) — *{}*\n", h.url, h.source);
        if !current.is_empty() && current.chars().count() + line.chars().count() > CHUNK_LIMIT {
            chunks.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(&line);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

pub fn build_embed(
    schedule: ScheduleType,
    text: &DigestText,
    headlines: &[Headline],
    prices: &[PriceQuote],
    now: DateTime<Utc>,
) -> Embed {
    let icon = match schedule {
        ScheduleType::Morning => "🌅",
        ScheduleType::Evening => "🌆",
    };
    let mut fields = Vec::new();
    if !prices.is_empty() {
        let value = prices
            .iter()
            .map(|p| {
                let change = p.change_24h_pct.unwrap_or(0.0);
                let dot = if change >= 0.0 { "🟢" } else { "🔴" };
                format!("{dot} **{}** `{}` ({})", p.symbol, format_price(p.usd), format_change(change))
            })
            .collect::<Vec<_>>()
            .join("\n");
        fields.push(EmbedField {
            name: "💰 ราคาตลาด".to_string(),
            value,
            inline: false,
        });
    }
    for (i, chunk) in headline_chunks(headlines).into_iter().enumerate() {
        fields.push(EmbedField {
            name: if i == 0 {
                format!("📰 ข่าวเด่น {} ข่าว", headlines.len())
            } else {
                "\u{200b}".to_string()
            },
            value: chunk,
            inline: false,
        });
    }

    Embed {
        title: format!("{icon} {}", text.section_title),
        description: truncate_description(&text.market_context, DESCRIPTION_LIMIT),
        color: EMBED_COLOR,
        fields,
        footer: Some(EmbedFooter {
            text: "Crypto News Bot • สรุปทุก 7:00 & 19:00 น.".to_string(),
        }),
        timestamp: now.to_rfc3339(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigestOutcome {
    pub summary_id: i64,
    pub headline_count: usize,
    pub used_fallback: bool,
    /// `None` when no webhook was configured.
    pub delivered: Option<bool>,
}

pub struct DigestGenerator {
    store: Store,
    llm: DynLlm,
    prices: Option<Arc<dyn PriceSource>>,
    http: reqwest::Client,
    offset: FixedOffset,
}

impl DigestGenerator {
    pub fn new(store: Store, llm: DynLlm, http: reqwest::Client, offset: FixedOffset) -> Self {
        ensure_metrics_described();
        Self {
            store,
            llm,
            prices: None,
            http,
            offset,
        }
    }

    pub fn with_prices(mut self, p: Arc<dyn PriceSource>) -> Self {
        self.prices = Some(p);
        self
    }

    async fn snapshot_prices(&self) -> Vec<PriceQuote> {
        let Some(src) = &self.prices else {
            return Vec::new();
        };
        match src.fetch_prices().await {
            Ok(p) => p,
            Err(e) => {
                warn!(provider = "coingecko", error = ?e, "price snapshot failed, continuing without prices");
                Vec::new()
            }
        }
    }

    pub async fn generate(&self, schedule: ScheduleType, webhook_url: Option<&str>) -> Result<DigestOutcome> {
        let now = Utc::now();
        let cutoff = self
            .store
            .last_summary_at(None)
            .await
            .context("reading last summary time")?
            .unwrap_or_else(|| now - Duration::hours(FALLBACK_LOOKBACK_HOURS));
        let headlines = self
            .store
            .digest_headlines(cutoff, HEADLINE_LIMIT)
            .await
            .context("loading digest headlines")?;
        let prices = self.snapshot_prices().await;

        let prompt = build_prompt(schedule, &headlines, &prices, now.with_timezone(&self.offset));
        let opts = CompletionOptions {
            temperature: 0.4,
            max_tokens: 2_000,
        };
        let (text, used_fallback) = match self.llm.complete(&prompt, opts).await {
            Ok(reply) => match parse_digest_response(&reply) {
                Some(t) => (t, false),
                None => {
                    warn!(schedule = %schedule, "unusable digest completion, using fallback text");
                    (fallback_text(schedule, headlines.len()), true)
                }
            },
            Err(e) => {
                warn!(schedule = %schedule, error = %e, "digest LLM call failed, using fallback text");
                (fallback_text(schedule, headlines.len()), true)
            }
        };
        counter!("digest_runs_total", "outcome" => if used_fallback { "fallback" } else { "llm" }).increment(1);

        let summary_id = self
            .store
            .insert_summary(&NewMarketSummary {
                schedule_type: schedule,
                summary_text: text.market_context.clone(),
                section_title: Some(text.section_title.clone()),
                headlines: headlines.clone(),
                prices: prices.clone(),
                llm_model: (!used_fallback).then(|| self.llm.model().to_string()),
            })
            .await
            .context("storing market summary")?;

        let delivered = match webhook_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => {
                let embed = build_embed(schedule, &text, &headlines, &prices, now);
                let outcome = DiscordWebhook::new(url.to_string(), self.http.clone())
                    .send_embed(&embed)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(e) = &outcome {
                    warn!(summary_id, error = %e, "digest delivery failed");
                }
                let ok = outcome.is_ok();
                self.store
                    .record_summary_delivery(summary_id, outcome)
                    .await
                    .context("recording digest delivery")?;
                Some(ok)
            }
            None => {
                warn!(summary_id, "no webhook configured, digest stored without delivery");
                None
            }
        };

        info!(
            summary_id,
            schedule = %schedule,
            headlines = headlines.len(),
            prices = prices.len(),
            used_fallback,
            "digest generated"
        );
        Ok(DigestOutcome {
            summary_id,
            headline_count: headlines.len(),
            used_fallback,
            delivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headline(i: usize) -> Headline {
        Headline {
            article_id: i as i64,
            title: format!("Headline number {i} about a market moving event in crypto"),
            url: format!("https://news.example/{i}"),
            source: "Wire".into(),
            sentiment: None,
            market_impact: None,
            summary: None,
            published_at: None,
        }
    }

    #[test]
    fn response_parsing_and_fallback() {
        let t = parse_digest_response("```json\n{\"market_context\": \"ตลาด sideway\", \"section_title\": \"\"}\n```").unwrap();
        assert_eq!(t.market_context, "ตลาด sideway");
        assert_eq!(t.section_title, "สรุปตลาดคริปโต");
        assert!(parse_digest_response("{\"section_title\": \"x\"}").is_none());
        assert!(parse_digest_response("no json").is_none());

        let f = fallback_text(ScheduleType::Evening, 7);
        assert!(f.market_context.contains("7 ข่าว"));
        assert!(f.section_title.ends_with("เย็น"));
    }

    #[test]
    fn description_is_cut_on_a_word() {
        let text = "word ".repeat(400);
        let out = truncate_description(&text, DESCRIPTION_LIMIT);
        assert!(out.ends_with("word..."));
        assert!(out.chars().count() <= DESCRIPTION_LIMIT + 3);
        assert_eq!(truncate_description("short", DESCRIPTION_LIMIT), "short");
    }

    #[test]
    fn embed_fields_respect_limits() {
        let hs: Vec<Headline> = (0..20).map(headline).collect();
        let prices = vec![PriceQuote {
            symbol: "BTC".into(),
            usd: 100_000.0,
            change_24h_pct: Some(-2.0),
        }];
        let text = fallback_text(ScheduleType::Morning, hs.len());
        let embed = build_embed(ScheduleType::Morning, &text, &hs, &prices, Utc::now());
        assert_eq!(embed.color, EMBED_COLOR);
        assert!(embed.title.starts_with("🌅"));
        assert!(embed.fields[0].value.contains("🔴 **BTC** `$100,000` (-2.00%)"));
        assert!(embed.fields.len() >= 3);
        assert!(embed.fields[1].name.contains("20"));
        assert!(embed.fields.iter().all(|f| f.value.chars().count() < crate::notify::FIELD_VALUE_LIMIT));
        let listed: usize = embed.fields[1..].iter().map(|f| f.value.lines().count()).sum();
        assert_eq!(listed, EMBED_HEADLINES);
    }
}
