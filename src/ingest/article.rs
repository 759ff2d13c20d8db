//! Article body fetch and readable-text extraction.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use std::time::Duration;

use crate::ingest::fetch_text;
use crate::ingest::types::FetchError;
use crate::retry::{Retry, RetryPolicy};

const MAX_TEXT_CHARS: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedPage {
    pub title: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
    timeout: Duration,
    policy: RetryPolicy,
}

impl HttpPageFetcher {
    /// `client` should already carry the configured user agent (see `ingest::http_client`).
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            policy: RetryPolicy::new(3, 1_000),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let html = Retry::new(self.policy)
            .when(|e: &FetchError| e.is_transient())
            .on_retry(|e, n, d| {
                tracing::warn!(error = %e, attempt = n, delay_ms = d.as_millis() as u64, url, "article fetch retry");
            })
            .run(|| {
                fetch_text(
                    &self.client,
                    url,
                    self.timeout,
                    "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8",
                )
            })
            .await?;
        Ok(extract_readable(&html))
    }
}

/// Elements whose text is never part of the article.
const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form", "iframe", "svg",
];
/// Elements that break a text run, so adjacent paragraphs do not fuse.
const BLOCKS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "section", "blockquote", "tr", "td",
    "figcaption", "pre",
];

fn first<'a>(doc: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    let found = doc.select(&selector).next();
    found
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) if SKIPPED.contains(&e.name()) => {}
            Node::Element(e) => {
                let Some(inner) = ElementRef::wrap(child) else { continue };
                let block = BLOCKS.contains(&e.name());
                if block {
                    out.push(' ');
                }
                collect_text(inner, out);
                if block {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

/// Pull the page title and the readable body text out of raw HTML.
///
/// Prefers the `<article>` element, falls back to `<body>`, then the whole document.
/// Scripts, styles and page chrome (nav/header/footer/aside/form) are skipped.
pub fn extract_readable(html: &str) -> FetchedPage {
    static RE_WS: OnceCell<Regex> = OnceCell::new();

    let doc = Html::parse_document(html);
    let title = first(&doc, "title")
        .map(|t| crate::ingest::normalize_text(&t.text().collect::<String>(), 500))
        .filter(|t| !t.is_empty());

    let region = first(&doc, "article")
        .or_else(|| first(&doc, "body"))
        .unwrap_or_else(|| doc.root_element());
    let mut raw = String::new();
    collect_text(region, &mut raw);

    let ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    let mut text = ws.replace_all(&raw, " ").trim().to_string();
    if text.chars().count() > MAX_TEXT_CHARS {
        text = text.chars().take(MAX_TEXT_CHARS).collect();
    }

    FetchedPage { title, text }
}
