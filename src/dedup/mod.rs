//! # Deduplication primitives
//! URL normalization, the dedup hash, title similarity and the source allowlist.
//!
//! These are pure functions; the stateful window lives in [`engine`].

pub mod engine;
pub mod noise;

pub use engine::{DedupEngine, DuplicateReason, Verdict, WindowEntry};
pub use noise::{noise_reason, NoiseReason};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// Title similarity at or above this is a duplicate.
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Query parameters dropped by [`normalize_url`] besides every `utm_*` key.
pub const TRACKING_PARAMS: &[&str] = &["ref", "source", "fbclid", "gclid", "mc_cid", "mc_eid"];

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Canonical form of an article URL used as a dedup key.
///
/// Drops tracking parameters, a leading `www.`, trailing path slashes and the fragment; sorts the
/// remaining query parameters; lowercases the result. Unparseable input is only trimmed and
/// lowercased. The function is idempotent.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(u) if u.host_str().is_some() => u,
        _ => return trimmed.to_lowercase(),
    };

    let host = parsed
        .host_str()
        .unwrap_or_default()
        .to_ascii_lowercase();
    // A host made only of `www.` labels is kept as is.
    let host = match host.trim_start_matches("www.") {
        "" => host.as_str(),
        rest => rest,
    };

    let mut out = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{port}"));
    }

    let path = parsed.path().trim_end_matches('/');
    out.push_str(if path.is_empty() { "/" } else { path });

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        out.push('?');
        out.push_str(&query);
    }

    out.to_lowercase()
}

/// `sha256(lower(trim(title)) | normalize_url(url) | YYYY-MM-DD)` as lowercase hex.
pub fn article_hash(title: &str, url: &str, published_at: Option<DateTime<Utc>>) -> String {
    let date = published_at
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(b"|");
    hasher.update(date.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Case-insensitive normalized Levenshtein similarity in `[0, 1]`.
///
/// Equal strings (including two empty ones) score 1; one empty side scores 0.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// Which duplicate predicates two articles satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchSignals {
    pub url: bool,
    pub title: bool,
}

impl MatchSignals {
    pub fn any(&self) -> bool {
        self.url || self.title
    }
}

/// Evaluate both predicates. `*_url_normalized` must already be normalized.
pub fn match_signals(a_url_normalized: &str, a_title: &str, b_url_normalized: &str, b_title: &str) -> MatchSignals {
    MatchSignals {
        url: !a_url_normalized.is_empty() && a_url_normalized == b_url_normalized,
        title: title_similarity(a_title, b_title) >= TITLE_SIMILARITY_THRESHOLD,
    }
}

/// Same story: normalized URLs equal, or titles at least 85% similar.
pub fn is_duplicate_article(a_url: &str, a_title: &str, b_url: &str, b_title: &str) -> bool {
    normalize_url(a_url) == normalize_url(b_url)
        || title_similarity(a_title, b_title) >= TITLE_SIMILARITY_THRESHOLD
}

/// Explicit list of admitted sources. Entries match case-insensitively as substrings of either
/// the source label or the article URL. An empty list admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    entries: Vec<String>,
}

impl Allowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        use std::collections::BTreeSet;
        let set: BTreeSet<String> = entries
            .into_iter()
            .map(|s| s.as_ref().trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            entries: set.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn admits(&self, label: &str, url: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let label = label.to_lowercase();
        let url = url.to_lowercase();
        self.entries
            .iter()
            .any(|e| label.contains(e.as_str()) || url.contains(e.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_www_and_slashes() {
        assert_eq!(
            normalize_url("https://WWW.CoinDesk.com/Markets/BTC/?utm_source=x&b=2&a=1&fbclid=z#top"),
            "https://coindesk.com/markets/btc?a=1&b=2"
        );
        assert_eq!(normalize_url("https://example.com"), "https://example.com/");
        assert_eq!(normalize_url("https://example.com:8443/a/"), "https://example.com:8443/a");
    }

    #[test]
    fn unparseable_is_lowercased() {
        assert_eq!(normalize_url("  Not A Url "), "not a url");
    }

    #[test]
    fn idempotent_on_tricky_inputs() {
        for u in [
            "https://example.com/a?B=1&a=2",
            "https://www.www.example.com//x//",
            "https://example.com/caf\u{e9}?q=Hello World&UTM_SOURCE=x",
            "http://example.com/?ref=abc",
            "mailto:Someone@Example.com",
        ] {
            let once = normalize_url(u);
            assert_eq!(normalize_url(&once), once, "input {u}");
        }
    }

    #[test]
    fn hash_ignores_case_and_tracking() {
        let d = DateTime::parse_from_rfc3339("2025-10-14T08:00:00Z").unwrap().with_timezone(&Utc);
        let a = article_hash("Bitcoin Tops $120K", "https://www.x.com/a?utm_medium=rss", Some(d));
        let b = article_hash("  bitcoin tops $120k ", "https://x.com/a", Some(d));
        assert_eq!(a, b);
        assert_ne!(a, article_hash("Bitcoin Tops $120K", "https://x.com/a", None));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn similarity_edges() {
        assert_eq!(title_similarity("", ""), 1.0);
        assert_eq!(title_similarity("abc", ""), 0.0);
        assert_eq!(title_similarity("ABC", "abc"), 1.0);
        let s = title_similarity("Bitcoin hits new high", "Bitcoin hits new highs");
        assert!(s > 0.85 && s < 1.0);
    }

    #[test]
    fn allowlist_substring_match() {
        let wl = Allowlist::new(["Yahoo Finance", "x.com", " "]);
        assert_eq!(wl.entries().len(), 2);
        assert!(wl.admits("yahoo finance video", "https://a.b/c"));
        assert!(wl.admits("Someone", "https://x.com/status/1"));
        assert!(!wl.admits("Blog", "https://blog.example/p"));
        assert!(Allowlist::default().admits("anything", ""));
    }
}
