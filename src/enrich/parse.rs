//! Structured-output parsing for LLM completions.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::tags::detect_tags;
use crate::store::{MarketImpact, Sentiment};

const MAX_TITLE_TH_CHARS: usize = 90;
const MAX_TAGS: usize = 5;

/// Enrichment fields as returned by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlmEnrichment {
    pub title_th: String,
    pub summary_th: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub sentiment: String,
    pub market_impact: String,
    #[serde(default)]
    pub cautions: Vec<String>,
    #[serde(default)]
    pub must_quote: Vec<String>,
}

impl LlmEnrichment {
    pub fn sentiment(&self) -> Sentiment {
        Sentiment::from_label(&self.sentiment)
    }

    pub fn market_impact(&self) -> MarketImpact {
        MarketImpact::from_label(&self.market_impact)
    }

    fn validate(mut self) -> Result<Self, String> {
        self.title_th = self.title_th.trim().to_string();
        if self.title_th.is_empty() {
            return Err("title_th is empty".into());
        }
        if self.title_th.chars().count() > MAX_TITLE_TH_CHARS {
            self.title_th = self.title_th.chars().take(MAX_TITLE_TH_CHARS).collect();
        }
        if self.summary_th.trim().chars().count() < 10 {
            return Err("summary_th is too short".into());
        }
        self.tags.retain(|t| !t.trim().is_empty());
        if self.tags.is_empty() {
            return Err("no tags".into());
        }
        self.tags.truncate(MAX_TAGS);
        let s = self.sentiment.trim().to_ascii_lowercase();
        if !matches!(s.as_str(), "bullish" | "bearish" | "neutral") {
            return Err(format!("unknown sentiment {:?}", self.sentiment));
        }
        let m = self.market_impact.trim().to_ascii_lowercase();
        if !matches!(m.as_str(), "high" | "medium" | "low") {
            return Err(format!("unknown market_impact {:?}", self.market_impact));
        }
        Ok(self)
    }
}

/// The span from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Repair trailing commas and unquoted keys.
pub fn repair_json(raw: &str) -> String {
    static TRAILING: OnceCell<Regex> = OnceCell::new();
    static UNQUOTED: OnceCell<Regex> = OnceCell::new();
    let trailing = TRAILING.get_or_init(|| Regex::new(r",(\s*[}\]])").unwrap());
    let unquoted = UNQUOTED.get_or_init(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());
    let fixed = trailing.replace_all(raw, "$1");
    unquoted.replace_all(&fixed, "$1\"$2\":").into_owned()
}

/// Locate and parse the JSON object in a completion, repairing it once if needed.
pub fn parse_json_response(text: &str) -> Result<Value, String> {
    let obj = extract_json_object(text).ok_or("no JSON object found in response")?;
    match serde_json::from_str(obj) {
        Ok(v) => Ok(v),
        Err(first) => serde_json::from_str(&repair_json(obj)).map_err(|_| format!("failed to parse JSON: {first}")),
    }
}

pub fn parse_enrichment(text: &str) -> Result<LlmEnrichment, String> {
    let value = parse_json_response(text)?;
    let parsed: LlmEnrichment = serde_json::from_value(value).map_err(|e| e.to_string())?;
    parsed.validate()
}

/// Minimal enrichment used when the model output is unusable.
pub fn fallback_enrichment(title: &str, text: &str) -> LlmEnrichment {
    let mut tags = detect_tags(&format!("{title} {text}"));
    tags.truncate(3);
    if tags.is_empty() {
        tags.push("Altcoin".into());
    }
    let short: String = title.chars().take(80).collect();
    LlmEnrichment {
        title_th: format!("{short}..."),
        summary_th: "เนื้อหาบทความมีจำกัด ไม่สามารถสรุปได้อย่างครบถ้วน กรุณาอ่านบทความต้นฉบับสำหรับข้อมูลเพิ่มเติม".into(),
        tags,
        sentiment: "neutral".into(),
        market_impact: "low".into(),
        cautions: vec!["สรุปอัตโนมัติสำรอง: เนื้อหาบทความมีจำกัด ข้อมูลอาจไม่ครบถ้วน".into()],
        must_quote: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{"title_th":"บิตคอยน์ทำจุดสูงสุดใหม่","summary_th":"ราคาบิตคอยน์ปรับตัวขึ้นต่อเนื่องหลังกองทุน ETF มีเงินไหลเข้า","tags":["BTC","ETF"],"sentiment":"Bullish","market_impact":"high"}"#;

    #[test]
    fn extracts_object_from_chatter() {
        let text = format!("Sure! Here you go:\n```json\n{GOOD}\n```\nAnything else?");
        let e = parse_enrichment(&text).unwrap();
        assert_eq!(e.sentiment(), Sentiment::Bullish);
        assert_eq!(e.market_impact(), MarketImpact::High);
        assert!(e.cautions.is_empty());
    }

    #[test]
    fn repairs_trailing_commas_and_bare_keys() {
        let raw = r#"{title_th: "x", "tags": ["BTC",], }"#;
        let v = parse_json_response(raw).unwrap();
        assert_eq!(v["title_th"], "x");
        assert_eq!(v["tags"][0], "BTC");
    }

    #[test]
    fn rejects_invalid_shapes() {
        assert!(parse_enrichment("no json at all").is_err());
        let bad_sentiment = GOOD.replace("Bullish", "moon");
        assert!(parse_enrichment(&bad_sentiment).is_err());
        let no_tags = GOOD.replace(r#"["BTC","ETF"]"#, "[]");
        assert!(parse_enrichment(&no_tags).is_err());
    }

    #[test]
    fn fallback_is_neutral_low_with_detected_tags() {
        let f = fallback_enrichment("Ethereum staking yields climb", "");
        assert_eq!(f.sentiment(), Sentiment::Neutral);
        assert_eq!(f.market_impact(), MarketImpact::Low);
        assert!(f.tags.contains(&"ETH".to_string()));
        assert_eq!(fallback_enrichment("Quiet day", "").tags, vec!["Altcoin".to_string()]);
        assert!(!f.cautions.is_empty());
    }
}
