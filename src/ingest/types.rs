// src/ingest/types.rs
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Common shape every source adapter produces.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CandidateItem {
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_label: String, // e.g. "CoinDesk", "Yahoo Finance"
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub sentiment_hint: Option<String>,
    pub category: Option<String>,
}

impl CandidateItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>, source_label: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            published_at: None,
            source_label: source_label.into(),
            summary: None,
            tags: Vec::new(),
            sentiment_hint: None,
            category: None,
        }
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// Outbound fetch failure. `Timeout` is kept distinct so callers can log it without
/// re-queueing the whole job.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed payload from {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FetchError {
    pub fn from_reqwest(url: &str, timeout: Duration, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if let Some(status) = e.status() {
            FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                source: e,
            }
        }
    }

    pub fn parse(url: &str, reason: impl Into<String>) -> Self {
        FetchError::Parse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Parse { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Items published at or after `since` (items without a date are kept).
    async fn fetch_candidates(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError>;
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let t = FetchError::Timeout {
            url: "u".into(),
            timeout_ms: 10,
        };
        assert!(t.is_transient() && t.is_timeout());
        let s503 = FetchError::Status {
            url: "u".into(),
            status: 503,
        };
        assert!(s503.is_transient());
        let s404 = FetchError::Status {
            url: "u".into(),
            status: 404,
        };
        assert!(!s404.is_transient());
        assert!(!FetchError::parse("u", "bad json").is_transient());
    }
}
