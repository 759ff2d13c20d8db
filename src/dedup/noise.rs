//! Low-value title taxonomy.
//!
//! Titles shorter than [`MIN_TITLE_CHARS`] are always noise. Otherwise the title is checked
//! against fixed, case-insensitive pattern groups: promotional markers, price-prediction
//! clickbait, coin listicles, daily TA recaps, giveaway spam, thin percentage-move rehashes and
//! aggregator index pages.

use once_cell::sync::OnceCell;
use regex::Regex;

pub const MIN_TITLE_CHARS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseReason {
    TitleTooShort,
    SourceNotAllowed,
    Promotional,
    PricePrediction,
    Listicle,
    TechnicalAnalysis,
    Giveaway,
    ThinPriceMove,
    IndexPage,
}

impl NoiseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseReason::TitleTooShort => "title_too_short",
            NoiseReason::SourceNotAllowed => "source_not_allowed",
            NoiseReason::Promotional => "promotional",
            NoiseReason::PricePrediction => "price_prediction",
            NoiseReason::Listicle => "listicle",
            NoiseReason::TechnicalAnalysis => "technical_analysis",
            NoiseReason::Giveaway => "giveaway",
            NoiseReason::ThinPriceMove => "thin_price_move",
            NoiseReason::IndexPage => "index_page",
        }
    }
}

const PATTERNS: &[(NoiseReason, &str)] = &[
    (NoiseReason::Promotional, r"\bsponsored\b"),
    (NoiseReason::Promotional, r"\bpress release\b"),
    (NoiseReason::Promotional, r"\bpartner content\b"),
    (NoiseReason::Promotional, r"\badvertorial\b"),
    (NoiseReason::Promotional, r"\bpaid post\b"),
    (NoiseReason::PricePrediction, r"\bprice prediction\b"),
    (NoiseReason::PricePrediction, r"\bprice forecast\b"),
    (NoiseReason::PricePrediction, r"\bprice target\b"),
    (NoiseReason::PricePrediction, r"\bwill reach \$[\d,]+"),
    (NoiseReason::PricePrediction, r"\bcould (hit|reach) \$[\d,]+"),
    (NoiseReason::PricePrediction, r"\bto the moon\b"),
    (NoiseReason::PricePrediction, r"\brealistic price\b"),
    (NoiseReason::Listicle, r"\btop \d+ (best )?(crypto|coin|altcoin|token)"),
    (NoiseReason::Listicle, r"\b\d+ best (crypto|coin|altcoin|token)"),
    (NoiseReason::Listicle, r"\b\d+ (crypto|coin|altcoin|token)s? to (buy|watch|invest)"),
    (NoiseReason::TechnicalAnalysis, r"^(ta|technical analysis):"),
    (NoiseReason::TechnicalAnalysis, r"technical analysis\b.*\b(daily|weekly|hourly)"),
    (NoiseReason::TechnicalAnalysis, r"chart (pattern|analysis)\b.*\b(shows|suggests|indicates)"),
    (NoiseReason::Giveaway, r"\bgiveaway\b"),
    (NoiseReason::Giveaway, r"\bfree (token|coin|crypto|nft)s?\b"),
    (NoiseReason::Giveaway, r"\bclaim (your )?(free )?(token|coin|airdrop)"),
    (
        NoiseReason::ThinPriceMove,
        r"\bprice (dips|drops|falls|rises|surges|jumps|pumps|dumps|slips|gains) [\d.]+%",
    ),
    (NoiseReason::IndexPage, r"crypto news\s*&\s*price indexes"),
];

fn compiled() -> &'static [(NoiseReason, Regex)] {
    static RE: OnceCell<Vec<(NoiseReason, Regex)>> = OnceCell::new();
    RE.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|(reason, p)| (*reason, Regex::new(&format!("(?i){p}")).unwrap()))
            .collect()
    })
}

/// Why a title is noise, or `None` when it is worth keeping.
pub fn noise_reason(title: &str) -> Option<NoiseReason> {
    let t = title.trim();
    if t.chars().count() < MIN_TITLE_CHARS {
        return Some(NoiseReason::TitleTooShort);
    }
    compiled()
        .iter()
        .find(|(_, re)| re.is_match(t))
        .map(|(reason, _)| *reason)
}

pub fn is_noise_title(title: &str) -> bool {
    noise_reason(title).is_some()
}
