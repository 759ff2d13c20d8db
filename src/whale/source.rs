//! Wallet-ranking data source: an out-of-process command whose output carries a JSON object
//! somewhere in stdout/stderr.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

pub const DEFAULT_COMMAND: &[&str] = &["mcporter", "call", "senpi.discovery_get_top_traders", "limit=50"];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

#[async_trait]
pub trait RankingSource: Send + Sync {
    /// Raw output text; parsing happens in [`parse_payload`].
    async fn fetch_raw(&self) -> Result<String>;
    fn describe(&self) -> String;
}

pub struct CommandSource {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            bail!("whale ranking command is empty");
        }
        Ok(Self { argv, timeout })
    }

    pub fn default_command() -> Self {
        Self {
            argv: DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl RankingSource for CommandSource {
    async fn fetch_raw(&self) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", self.describe(), self.timeout))?
            .with_context(|| format!("spawning {}", self.describe()))?;

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let combined = combined.trim();
        if combined.is_empty() {
            bail!("{} returned empty output (status {})", self.describe(), output.status);
        }
        Ok(combined.to_string())
    }

    fn describe(&self) -> String {
        self.argv.join(" ")
    }
}

/// Parsed ranking output: the full JSON object plus the located record list.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingPayload {
    pub raw: Value,
    pub records: Vec<Value>,
}

/// Record list inside `data`: an array itself, or the first array under
/// `traders`/`items`/`results`/`data`.
pub fn locate_records(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => ["traders", "items", "results", "data"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub fn parse_payload(text: &str) -> Result<RankingPayload> {
    let start = text.find('{').ok_or_else(|| anyhow!("no JSON object found in command output"))?;
    let end = text.rfind('}').filter(|e| *e > start).ok_or_else(|| anyhow!("no JSON object found in command output"))?;
    let raw: Value = serde_json::from_str(&text[start..=end]).context("parsing ranking payload")?;
    if raw.get("success").and_then(Value::as_bool) == Some(false) {
        bail!("ranking source reported success=false");
    }
    let records = match raw.get("data") {
        Some(data) => locate_records(data),
        None => locate_records(&raw),
    };
    Ok(RankingPayload { raw, records })
}
