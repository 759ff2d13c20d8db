//! Tag vocabulary, keyword tag detection and tag → ticker/slug lookups.

use once_cell::sync::OnceCell;
use regex::Regex;

pub const TAG_VOCABULARY: &[&str] = &[
    "BTC", "ETH", "DeFi", "NFT", "Memecoin", "ETF", "Macro", "Regulation", "L2", "AI", "Stablecoin",
    "Exchange", "Mining", "Hack", "Airdrop", "Altcoin", "Solana", "Gaming", "DAO", "Bridge",
];

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    ("BTC", &["bitcoin", "btc", "satoshi", "halving", "btc/usd"]),
    ("ETH", &["ethereum", "eth", "vitalik", "eth2", "beacon chain", "eth/usd"]),
    ("DeFi", &["defi", "decentralized finance", "yield", "liquidity", "amm", "dex", "lending", "borrowing"]),
    ("NFT", &["nft", "nfts", "non-fungible", "opensea", "digital art", "collectible"]),
    ("Memecoin", &["memecoin", "meme coin", "doge", "dogecoin", "shiba", "pepe", "floki", "bonk"]),
    ("ETF", &["etf", "etfs", "exchange traded fund", "blackrock", "grayscale", "spot bitcoin"]),
    ("Macro", &["federal reserve", "fed", "interest rate", "inflation", "cpi", "gdp", "treasury", "yield curve"]),
    ("Regulation", &["sec", "regulation", "compliance", "lawsuit", "legal", "court", "ban", "cbdc", "congress", "senate"]),
    ("L2", &["layer 2", "layer-2", "l2", "rollup", "optimism", "arbitrum", "zksync", "polygon", "scaling"]),
    ("AI", &["artificial intelligence", "ai", "machine learning", "gpt", "llm"]),
    ("Stablecoin", &["stablecoin", "stablecoins", "usdt", "usdc", "tether", "dai", "peg"]),
    ("Exchange", &["binance", "coinbase", "kraken", "ftx", "exchange", "cex", "trading volume"]),
    ("Mining", &["mining", "miner", "miners", "hashrate", "hash rate", "proof of work", "asic"]),
    ("Hack", &["hack", "hacked", "exploit", "security breach", "stolen", "vulnerability", "attack", "drain"]),
    ("Airdrop", &["airdrop", "token distribution", "free tokens"]),
    ("Solana", &["solana", "sol", "phantom", "raydium", "jupiter"]),
    ("Gaming", &["gamefi", "play to earn", "p2e", "gaming", "metaverse"]),
    ("DAO", &["dao", "decentralized autonomous", "governance", "proposal"]),
    ("Bridge", &["bridge", "cross-chain", "interoperability", "multichain", "wormhole"]),
    ("Altcoin", &["altcoin", "altcoins", "alt season"]),
];

fn topic_patterns() -> &'static [(&'static str, Regex)] {
    static RE: OnceCell<Vec<(&'static str, Regex)>> = OnceCell::new();
    RE.get_or_init(|| {
        TOPIC_KEYWORDS
            .iter()
            .map(|(tag, kws)| {
                let alt = kws.iter().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
                (*tag, Regex::new(&format!(r"(?i)\b(?:{alt})\b")).unwrap())
            })
            .collect()
    })
}

/// Keyword tag detection, in vocabulary order. Keywords match on word boundaries.
pub fn detect_tags(text: &str) -> Vec<String> {
    topic_patterns()
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(tag, _)| tag.to_string())
        .collect()
}

/// Exchange ticker used by the external sentiment providers.
pub fn ticker_for_tag(tag: &str) -> Option<&'static str> {
    let t = tag.trim();
    let ticker = match t.to_ascii_lowercase().as_str() {
        "btc" | "bitcoin" => "BTCUSD",
        "eth" | "ethereum" => "ETHUSD",
        "sol" | "solana" => "SOLUSD",
        "hype" | "hyperliquid" => "HYPEUSD",
        "xrp" | "ripple" => "XRPUSD",
        "ada" | "cardano" => "ADAUSD",
        "doge" | "dogecoin" => "DOGEUSD",
        "matic" | "polygon" => "MATICUSD",
        "avax" | "avalanche" => "AVAXUSD",
        "dot" | "polkadot" => "DOTUSD",
        "link" | "chainlink" => "LINKUSD",
        _ => return None,
    };
    Some(ticker)
}

/// First tag with a known ticker.
pub fn primary_ticker(tags: &[String]) -> Option<&'static str> {
    tags.iter().find_map(|t| ticker_for_tag(t))
}

/// Santiment project slug for a tag.
pub fn santiment_slug(tag: &str) -> Option<&'static str> {
    let slug = match tag.trim().to_ascii_lowercase().as_str() {
        "btc" | "bitcoin" => "bitcoin",
        "eth" | "ethereum" => "ethereum",
        "sol" | "solana" => "solana",
        "xrp" | "ripple" => "xrp",
        "ada" | "cardano" => "cardano",
        "doge" | "dogecoin" => "dogecoin",
        "matic" | "polygon" => "matic-network",
        "avax" | "avalanche" => "avalanche",
        "dot" | "polkadot" => "polkadot-new",
        "link" | "chainlink" => "chainlink",
        "arb" | "arbitrum" => "arbitrum",
        "op" | "optimism" => "optimism-ethereum",
        _ => return None,
    };
    Some(slug)
}

/// Distinct slugs for the first `cap` tags that have one.
pub fn metric_slugs(tags: &[String], cap: usize) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for slug in tags.iter().filter_map(|t| santiment_slug(t)) {
        if out.len() >= cap {
            break;
        }
        if !out.contains(&slug) {
            out.push(slug);
        }
    }
    out
}
