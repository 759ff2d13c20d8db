use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::retry::{Retry, RetryPolicy};

/// Discord rejects field values above 1024 characters.
pub const FIELD_VALUE_LIMIT: usize = 1024;

#[derive(Clone)]
pub struct DiscordWebhook {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordWebhook {
    pub fn new(webhook: String, client: Client) -> Self {
        Self {
            webhook,
            client,
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// POST one embed. Non-2xx responses and transport errors are retried with
    /// `500ms << (attempt - 1)` pauses; the final error carries the response body.
    pub async fn send_embed(&self, embed: &Embed) -> Result<()> {
        let payload = WebhookPayload {
            content: None,
            embeds: vec![embed.clone()],
        };

        Retry::new(RetryPolicy::new(u32::from(self.max_retries.saturating_sub(1)), 500))
            .on_retry(|e: &anyhow::Error, attempt, delay| {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Discord webhook attempt failed, retrying"
                );
            })
            .run(|| self.post(&payload))
            .await
    }

    async fn post(&self, payload: &WebhookPayload) -> Result<()> {
        let rsp = self
            .client
            .post(&self.webhook)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("Discord webhook request failed: {e}"))?;
        if rsp.status().is_success() {
            return Ok(());
        }
        let status = rsp.status();
        let body = rsp.text().await.unwrap_or_default();
        Err(anyhow!("Discord webhook error: {} - {}", status.as_u16(), body.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    /// RFC 3339.
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    embeds: Vec<Embed>,
}
