//! Heuristic enrichment for aggregator-API items, which arrive with their own category,
//! sentiment and tickers and skip the body-fetch and LLM stages.

use crate::ingest::types::CandidateItem;
use crate::store::{MarketImpact, NewEnrichment, Sentiment};

pub const API_PROVIDER_LABEL: &str = "API_SOURCE";
pub const HEURISTIC_PROVIDER_LABEL: &str = "external-heuristic";

const CATEGORY_RULES: &[(&str, &[&str])] = &[
    ("etf", &["etf", "sec ", "s.e.c"]),
    (
        "institutional",
        &[
            "institution", "bank", "wall street", "blackrock", "fidelity", "jpmorgan", "goldman",
            "grayscale", "microstrategy", "saylor", "coinbase", "binance", "kraken", "regulation",
            "treasury", "federal reserve", "fed ",
        ],
    ),
    ("bitcoin", &["bitcoin", "btc", "halving", "mining", "miner", "satoshi", "ordinals", "lightning network"]),
    (
        "research",
        &["ethereum", "eth ", "solana", "sol ", "xrp", "ripple", "cardano", "polkadot", "avalanche", "chainlink", "polygon"],
    ),
    (
        "defi",
        &["defi", "decentralized", "lending", "staking", "yield", "swap", "liquidity", "aave", "uniswap", "lido", "maker"],
    ),
    ("nft", &["nft", "metaverse", "gaming"]),
    ("research", &["research", "analysis", "report", "forecast", "outlook"]),
    (
        "research",
        &[
            "crypto", "blockchain", "token", "web3", "stablecoin", "usdt", "usdc", "cbdc", "hack", "exploit",
            "whale", "airdrop", "layer 2", "rollup",
        ],
    ),
];

const POSITIVE: &[&str] = &["bull", "surge", "rally", "gain", "soar", "jump", "record", "all-time", "breakout", "pump"];
const NEGATIVE: &[&str] = &["bear", "crash", "dump", "lose", "plunge", "drop", "fall", "fear", "risk", "warn", "threat", "ban"];

fn map_sentiment(hint: Option<&str>) -> Sentiment {
    match hint.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("positive") | Some("bullish") => Sentiment::Bullish,
        Some("negative") | Some("bearish") => Sentiment::Bearish,
        _ => Sentiment::Neutral,
    }
}

/// Category and sentiment guessed from a title; `("general", Neutral)` when nothing matches.
pub fn detect_from_title(title: &str) -> (&'static str, Sentiment) {
    let t = title.to_lowercase();
    let category = CATEGORY_RULES
        .iter()
        .find(|(_, kws)| kws.iter().any(|k| t.contains(k)))
        .map(|(c, _)| *c)
        .unwrap_or("general");
    let sentiment = if POSITIVE.iter().any(|k| t.contains(k)) {
        Sentiment::Bullish
    } else if NEGATIVE.iter().any(|k| t.contains(k)) {
        Sentiment::Bearish
    } else {
        Sentiment::Neutral
    };
    (category, sentiment)
}

pub fn market_impact(category: &str, sentiment: Sentiment) -> MarketImpact {
    match category {
        "institutional" | "etf" => MarketImpact::High,
        "bitcoin" if sentiment == Sentiment::Bullish => MarketImpact::High,
        "bitcoin" | "research" | "defi" => MarketImpact::Medium,
        _ => MarketImpact::Low,
    }
}

pub fn category_tags(category: &str, tickers: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = match category {
        "bitcoin" => vec!["BTC".into(), "Bitcoin".into()],
        "defi" => vec!["DeFi".into()],
        "institutional" => vec!["Institutional".into(), "Adoption".into()],
        "etf" => vec!["ETF".into(), "Regulation".into()],
        "nft" => vec!["NFT".into()],
        "research" => vec!["Analysis".into()],
        _ => Vec::new(),
    };
    for t in tickers {
        let upper = t.trim().to_uppercase();
        if !upper.is_empty() && !tags.contains(&upper) {
            tags.push(upper);
        }
    }
    tags
}

/// Enrichment for an accepted API item. `article_id` is filled in at insert time.
pub fn map_api_item(item: &CandidateItem) -> NewEnrichment {
    let mut sentiment = map_sentiment(item.sentiment_hint.as_deref());
    let mut category = item
        .category
        .as_deref()
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "general".to_string());

    if category == "general" || sentiment == Sentiment::Neutral {
        let (derived_cat, derived_sent) = detect_from_title(&item.title);
        if category == "general" && derived_cat != "general" {
            category = derived_cat.to_string();
        }
        if sentiment == Sentiment::Neutral {
            sentiment = derived_sent;
        }
    }

    NewEnrichment {
        article_id: 0,
        title_th: None,
        summary_th: item.summary.clone(),
        tags: category_tags(&category, &item.tags),
        sentiment,
        market_impact: market_impact(&category, sentiment),
        sentiment_confidence: None,
        cautions: Vec::new(),
        must_quote: Vec::new(),
        external_sentiment: None,
        santiment_metrics: None,
        llm_provider: API_PROVIDER_LABEL.to_string(),
        llm_model: None,
    }
}

/// Title-only enrichment for fetched articles while LLM enrichment is switched off.
pub fn heuristic_enrichment(article_id: i64, title: &str) -> NewEnrichment {
    let (category, sentiment) = detect_from_title(title);
    NewEnrichment {
        article_id,
        title_th: None,
        summary_th: None,
        tags: category_tags(category, &[]),
        sentiment,
        market_impact: market_impact(category, sentiment),
        sentiment_confidence: None,
        cautions: Vec::new(),
        must_quote: Vec::new(),
        external_sentiment: None,
        santiment_metrics: None,
        llm_provider: HEURISTIC_PROVIDER_LABEL.to_string(),
        llm_model: Some("title-analysis".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_item(title: &str, category: Option<&str>, sentiment: Option<&str>, tickers: &[&str]) -> CandidateItem {
        let mut it = CandidateItem::new(title, "https://agg.example/a", "Aggregator");
        it.category = category.map(str::to_string);
        it.sentiment_hint = sentiment.map(str::to_string);
        it.tags = tickers.iter().map(|t| t.to_string()).collect();
        it
    }

    #[test]
    fn provider_fields_drive_the_mapping() {
        let e = map_api_item(&api_item("Spot ETF flows", Some("etf"), Some("negative"), &["btc"]));
        assert_eq!(e.sentiment, Sentiment::Bearish);
        assert_eq!(e.market_impact, MarketImpact::High);
        assert_eq!(e.tags, vec!["ETF", "Regulation", "BTC"]);
        assert_eq!(e.llm_provider, API_PROVIDER_LABEL);
    }

    #[test]
    fn bitcoin_impact_depends_on_sentiment() {
        assert_eq!(market_impact("bitcoin", Sentiment::Bullish), MarketImpact::High);
        assert_eq!(market_impact("bitcoin", Sentiment::Neutral), MarketImpact::Medium);
        assert_eq!(market_impact("nft", Sentiment::Bullish), MarketImpact::Low);
    }

    #[test]
    fn heuristic_uses_title_only() {
        let e = heuristic_enrichment(5, "BlackRock files for staking ETF as inflows surge");
        assert_eq!(e.article_id, 5);
        assert_eq!(e.tags, vec!["ETF", "Regulation"]);
        assert_eq!(e.sentiment, Sentiment::Bullish);
        assert_eq!(e.market_impact, MarketImpact::High);
        assert_eq!(e.llm_provider, HEURISTIC_PROVIDER_LABEL);
    }

    #[test]
    fn title_fills_weak_provider_data() {
        let e = map_api_item(&api_item("Bitcoin rally extends to record high", Some("general"), None, &[]));
        assert_eq!(e.sentiment, Sentiment::Bullish);
        assert_eq!(e.market_impact, MarketImpact::High);
        assert_eq!(e.tags, vec!["BTC", "Bitcoin"]);
    }
}
