// src/ingest/providers/mod.rs
pub mod news_api;
pub mod rss;

use std::time::Duration;

use crate::ingest::types::SourceAdapter;

/// Builds adapters for job payloads. Jobs carry the feed/API location, so adapters are created
/// per job; the factory owns the shared client and timeouts.
pub trait SourceFactory: Send + Sync {
    fn rss(&self, label: &str, feed_url: &str) -> Box<dyn SourceAdapter>;
    fn news_api(&self, label: &str, base_url: &str) -> Box<dyn SourceAdapter>;
}

pub struct HttpSourceFactory {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSourceFactory {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl SourceFactory for HttpSourceFactory {
    fn rss(&self, label: &str, feed_url: &str) -> Box<dyn SourceAdapter> {
        Box::new(rss::RssAdapter::new(label, feed_url, self.client.clone()).with_timeout(self.timeout))
    }

    fn news_api(&self, label: &str, base_url: &str) -> Box<dyn SourceAdapter> {
        Box::new(news_api::NewsApiAdapter::new(label, base_url, self.client.clone()).with_timeout(self.timeout))
    }
}
