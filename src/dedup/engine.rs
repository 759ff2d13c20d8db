//! Windowed dedup/noise classifier.
//!
//! Checks run in a fixed order and stop at the first hit:
//! allowlist → hash → normalized URL → title similarity → noise patterns.
//! Accepted items join the window immediately, so later items of the same batch are compared
//! against them too.

use std::collections::HashSet;

use metrics::counter;

use super::noise::{noise_reason, NoiseReason};
use super::{article_hash, normalize_url, title_similarity, Allowlist, TITLE_SIMILARITY_THRESHOLD};
use crate::ingest::types::CandidateItem;

/// Dedup keys of one already-ingested article.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub hash: String,
    pub url_normalized: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "by")]
pub enum DuplicateReason {
    Hash,
    Url,
    Title { similarity: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Accepted; carries the computed keys for persistence.
    New(WindowEntry),
    Duplicate(DuplicateReason),
    Noise(NoiseReason),
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::New(_) => "new",
            Verdict::Duplicate(_) => "duplicate",
            Verdict::Noise(_) => "noise",
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Verdict::New(_))
    }
}

#[derive(Debug, Default)]
pub struct DedupEngine {
    allowlist: Option<Allowlist>,
    entries: Vec<WindowEntry>,
    hashes: HashSet<String>,
    urls: HashSet<String>,
}

impl DedupEngine {
    /// Engine over a recent window (typically the last 7 days of articles).
    pub fn new(window: Vec<WindowEntry>) -> Self {
        let mut engine = Self::default();
        for entry in window {
            engine.remember(entry);
        }
        engine
    }

    /// Reject items whose source is not on `allowlist`.
    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = Some(allowlist);
        self
    }

    pub fn window_len(&self) -> usize {
        self.entries.len()
    }

    fn remember(&mut self, entry: WindowEntry) {
        self.hashes.insert(entry.hash.clone());
        self.urls.insert(entry.url_normalized.clone());
        self.entries.push(entry);
    }

    /// Classify without touching the window.
    pub fn check(&self, item: &CandidateItem) -> Verdict {
        if let Some(allow) = &self.allowlist {
            if !allow.admits(&item.source_label, &item.url) {
                return Verdict::Noise(NoiseReason::SourceNotAllowed);
            }
        }

        let hash = article_hash(&item.title, &item.url, item.published_at);
        if self.hashes.contains(&hash) {
            return Verdict::Duplicate(DuplicateReason::Hash);
        }

        let url_normalized = normalize_url(&item.url);
        if self.urls.contains(&url_normalized) {
            return Verdict::Duplicate(DuplicateReason::Url);
        }

        if let Some(similarity) = self
            .entries
            .iter()
            .map(|e| title_similarity(&item.title, &e.title))
            .find(|s| *s >= TITLE_SIMILARITY_THRESHOLD)
        {
            return Verdict::Duplicate(DuplicateReason::Title { similarity });
        }

        if let Some(reason) = noise_reason(&item.title) {
            return Verdict::Noise(reason);
        }

        Verdict::New(WindowEntry {
            hash,
            url_normalized,
            title: item.title.clone(),
        })
    }

    /// Classify and, when new, append to the window.
    pub fn classify(&mut self, item: &CandidateItem) -> Verdict {
        let verdict = self.check(item);
        if let Verdict::New(entry) = &verdict {
            self.remember(entry.clone());
        }
        counter!("ingest_verdicts_total", "verdict" => verdict.label()).increment(1);
        verdict
    }
}
