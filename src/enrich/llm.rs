//! LLM provider abstraction.
//!
//! Providers must fail loudly: an unconfigured key, a non-2xx answer or an empty completion are
//! all errors, never an empty string.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ingest::types::FetchError;
use crate::retry::{Retry, RetryPolicy};

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM provider {0} has no API key configured")]
    NotConfigured(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("empty completion from {0}")]
    Empty(String),
    #[error("LLM provider error: {0}")]
    Other(String),
}

impl LlmError {
    /// Rate limits, 5xx and network failures. Auth and request errors are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Fetch(e) if e.is_transient())
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn complete(&self, prompt: &str, opts: CompletionOptions) -> Result<String, LlmError>;
}

pub type DynLlm = Arc<dyn LlmProvider>;

/// Build the configured provider. Unknown provider names are a configuration error.
pub fn build_provider(
    provider: &str,
    model: &str,
    api_key: Option<String>,
    client: reqwest::Client,
) -> anyhow::Result<DynLlm> {
    let key = api_key.filter(|k| !k.trim().is_empty());
    match provider.to_ascii_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAiCompatProvider::openai(client, key, model))),
        "openrouter" => Ok(Arc::new(OpenAiCompatProvider::openrouter(client, key, model))),
        "anthropic" | "claude" => Ok(Arc::new(AnthropicProvider::new(client, key, model))),
        "mock" => Ok(Arc::new(StaticLlm::new(model, MOCK_ENRICHMENT))),
        other => anyhow::bail!("unknown LLM provider: {other}"),
    }
}

const MOCK_ENRICHMENT: &str = r#"{"title_th":"ข่าวคริปโต (mock)","summary_th":"สรุปข่าวจากผู้ให้บริการจำลองสำหรับการทดสอบระบบ","tags":["BTC"],"sentiment":"neutral","market_impact":"low","cautions":[],"must_quote":[]}"#;

async fn post_json<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, &str)],
    bearer: Option<&str>,
    body: &B,
    timeout: Duration,
) -> Result<String, FetchError> {
    let mut req = client.post(url).timeout(timeout).json(body);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    if let Some(token) = bearer {
        req = req.bearer_auth(token);
    }
    let rsp = req
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

/// OpenAI chat-completions API and compatible gateways (OpenRouter).
pub struct OpenAiCompatProvider {
    name: &'static str,
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl OpenAiCompatProvider {
    pub fn openai(http: reqwest::Client, api_key: Option<String>, model: &str) -> Self {
        Self::with_endpoint("openai", http, OPENAI_ENDPOINT, api_key, model)
    }

    pub fn openrouter(http: reqwest::Client, api_key: Option<String>, model: &str) -> Self {
        Self::with_endpoint("openrouter", http, OPENROUTER_ENDPOINT, api_key, model)
    }

    pub fn with_endpoint(
        name: &'static str,
        http: reqwest::Client,
        endpoint: &str,
        api_key: Option<String>,
        model: &str,
    ) -> Self {
        Self {
            name,
            http,
            endpoint: endpoint.to_string(),
            api_key,
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            policy: RetryPolicy::new(1, 3_000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct ChatMsg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<ChatMsg<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResp {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMsg,
}

#[derive(Deserialize)]
struct ChatChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, opts: CompletionOptions) -> Result<String, LlmError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::NotConfigured(self.name.to_string()))?;
        let req = ChatReq {
            model: &self.model,
            messages: vec![ChatMsg {
                role: "user",
                content: prompt,
            }],
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        Retry::new(self.policy)
            .when(|e: &LlmError| e.is_retryable())
            .on_retry(|e, n, d| {
                tracing::warn!(error = %e, attempt = n, delay_ms = d.as_millis() as u64, provider = self.name, "retrying LLM request");
            })
            .run(|| async {
                let body = post_json(&self.http, &self.endpoint, &[], Some(key), &req, self.timeout).await?;
                let parsed: ChatResp = serde_json::from_str(&body)
                    .map_err(|e| FetchError::parse(&self.endpoint, e.to_string()))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| LlmError::Empty(self.name.to_string()))
            })
            .await
    }
}

/// Anthropic Messages API.
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(http: reqwest::Client, api_key: Option<String>, model: &str) -> Self {
        Self {
            http,
            api_key,
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            policy: RetryPolicy::new(1, 3_000),
        }
    }
}

#[derive(Serialize)]
struct MessagesReq<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMsg<'a>>,
}

#[derive(Deserialize)]
struct MessagesResp {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, opts: CompletionOptions) -> Result<String, LlmError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::NotConfigured("anthropic".into()))?;
        let req = MessagesReq {
            model: &self.model,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            messages: vec![ChatMsg {
                role: "user",
                content: prompt,
            }],
        };
        let headers = [("x-api-key", key), ("anthropic-version", ANTHROPIC_VERSION)];

        Retry::new(self.policy)
            .when(|e: &LlmError| e.is_retryable())
            .on_retry(|e, n, d| {
                tracing::warn!(error = %e, attempt = n, delay_ms = d.as_millis() as u64, provider = "anthropic", "retrying LLM request");
            })
            .run(|| async {
                let body = post_json(&self.http, ANTHROPIC_ENDPOINT, &headers, None, &req, self.timeout).await?;
                let parsed: MessagesResp = serde_json::from_str(&body)
                    .map_err(|e| FetchError::parse(ANTHROPIC_ENDPOINT, e.to_string()))?;
                let text: String = parsed.content.into_iter().filter_map(|b| b.text).collect();
                if text.trim().is_empty() {
                    Err(LlmError::Empty("anthropic".into()))
                } else {
                    Ok(text)
                }
            })
            .await
    }
}

/// Scripted provider for local runs and tests. Replies are served in order; the last one
/// repeats once the script is exhausted.
pub struct StaticLlm {
    model: String,
    replies: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Result<String, String>>,
    calls: AtomicUsize,
}

impl StaticLlm {
    pub fn new(model: &str, reply: &str) -> Self {
        Self::scripted(model, vec![Ok(reply.to_string())])
    }

    /// Always fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self::scripted("static", vec![Err(message.to_string())])
    }

    pub fn scripted(model: &str, replies: Vec<Result<String, String>>) -> Self {
        let last = replies
            .last()
            .cloned()
            .unwrap_or_else(|| Err("no scripted reply".to_string()));
        Self {
            model: model.to_string(),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for StaticLlm {
    fn name(&self) -> &str {
        "static"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, _prompt: &str, _opts: CompletionOptions) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut q = self.replies.lock().map_err(|_| LlmError::Other("poisoned".into()))?;
            q.pop_front()
        };
        let reply = match next {
            Some(r) => r,
            None => self
                .last
                .lock()
                .map_err(|_| LlmError::Other("poisoned".into()))?
                .clone(),
        };
        reply.map_err(LlmError::Other)
    }
}
