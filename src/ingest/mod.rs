// src/ingest/mod.rs
pub mod article;
pub mod config;
pub mod providers;
pub mod types;

use crate::ingest::types::FetchError;
use metrics::{describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use std::time::Duration;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_candidates_total",
            "Candidate items returned by a source fetch, per source."
        );
        describe_counter!(
            "ingest_verdicts_total",
            "Dedup engine verdicts (new/duplicate/noise)."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Source adapter fetch/parse errors."
        );
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
    });
}

/// Normalize feed text: decode entities, strip tags, unify quotes, collapse whitespace.
/// Output is capped at `max_chars` characters.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}

/// GET `url` and return the body as text. Non-2xx statuses become `FetchError::Status`.
pub(crate) async fn fetch_text(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    accept: &str,
) -> Result<String, FetchError> {
    let rsp = client
        .get(url)
        .timeout(timeout)
        .header(reqwest::header::ACCEPT, accept)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    rsp.text()
        .await
        .map_err(|e| FetchError::from_reqwest(url, timeout, e))
}

/// Shared HTTP client for the adapters: fixed user agent plus connect/request timeouts.
pub fn http_client(user_agent: &str, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .build()
        .context("building HTTP client")
}
