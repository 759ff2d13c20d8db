// src/config/mod.rs
//! Worker configuration: one TOML file, serde defaults for every key, secrets either inline
//! or `"ENV"` (read from the matching environment variable).

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::jobs::scheduler::{offset_hours, DigestSchedule, DigestSlot};
use crate::jobs::{QueueConfig, QueueKind, SchedulerConfig};
use crate::retry::RetryPolicy;
use crate::store::{ScheduleType, SourceSpec};
use crate::whale::RiskProfile;

pub const ENV_CONFIG_PATH: &str = "CRYPTOWIRE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/cryptowire.toml";

fn default_database_url() -> String {
    "sqlite://data/cryptowire.db".to_string()
}
fn default_user_agent() -> String {
    "CryptoNewsBot/1.0".to_string()
}
fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Prometheus exporter address; no exporter when unset.
    pub metrics_listen: Option<SocketAddr>,
    pub llm: LlmSettings,
    pub providers: ProviderKeys,
    pub scheduler: SchedulerSettings,
    pub digest: DigestSettings,
    pub whale: WhaleSettings,
    pub queue: QueueSettings,
    pub sources: Vec<SourceSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            user_agent: default_user_agent(),
            http_timeout_secs: default_http_timeout_secs(),
            metrics_listen: None,
            llm: LlmSettings::default(),
            providers: ProviderKeys::default(),
            scheduler: SchedulerSettings::default(),
            digest: DigestSettings::default(),
            whale: WhaleSettings::default(),
            queue: QueueSettings::default(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Off: fetched articles get a title-only enrichment and no LLM calls are made.
    pub enabled: bool,
    /// "openai" | "openrouter" | "anthropic" | "mock"
    pub provider: String,
    pub model: String,
    /// "ENV" means: read the provider's key variable.
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "openrouter".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            api_key: Some("ENV".to_string()),
        }
    }
}

impl LlmSettings {
    pub fn key_var(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "openai" => Some("OPENAI_API_KEY"),
            "openrouter" => Some("OPENROUTER_API_KEY"),
            "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderKeys {
    pub finnhub_api_key: Option<String>,
    pub fmp_api_key: Option<String>,
    pub santiment_api_key: Option<String>,
}

impl Default for ProviderKeys {
    fn default() -> Self {
        let env_marker = || Some("ENV".to_string());
        Self {
            finnhub_api_key: env_marker(),
            fmp_api_key: env_marker(),
            santiment_api_key: env_marker(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub fetch_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub pending_batch: i64,
    pub enrich_batch: i64,
    pub startup_backfill_hours: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 15 * 60,
            poll_interval_secs: 10,
            pending_batch: 10,
            enrich_batch: 5,
            startup_backfill_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestSettings {
    pub enabled: bool,
    pub utc_offset_hours: i32,
    /// "HH:MM" in the digest timezone.
    pub morning: String,
    pub evening: String,
    pub window_minutes: i64,
    /// Inline URL or "ENV" for `DISCORD_WEBHOOK_URL`. No delivery when unset.
    pub webhook_url: Option<String>,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            utc_offset_hours: 7,
            morning: "07:00".to_string(),
            evening: "19:00".to_string(),
            window_minutes: 90,
            webhook_url: Some("ENV".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhaleSettings {
    pub enabled: bool,
    /// Command and arguments; empty means the built-in ranking command.
    pub command: Vec<String>,
    pub risk_profile: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retain_snapshots: i64,
}

impl Default for WhaleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            risk_profile: "moderate".to_string(),
            interval_secs: 300,
            timeout_secs: 90,
            retain_snapshots: crate::whale::SNAPSHOT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Queue name → worker count, e.g. `enrich = 4`.
    pub concurrency: HashMap<String, usize>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2000,
            concurrency: HashMap::new(),
        }
    }
}

/// `"ENV"` → the variable's value; blank → `None`; anything else as-is.
pub fn resolve_secret(value: Option<&str>, var: &str) -> Option<String> {
    let v = value?.trim();
    if v.eq_ignore_ascii_case("env") {
        return env::var(var).ok().filter(|s| !s.trim().is_empty());
    }
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn parse_slot(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M").with_context(|| format!("invalid digest time {text:?}"))
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config")?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&data)
    }

    /// 1) $CRYPTOWIRE_CONFIG, 2) config/cryptowire.toml, 3) built-in defaults.
    /// `DATABASE_URL` overrides the file.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path");
            }
            Self::load_from(&pb)?
        } else if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::load_from(Path::new(DEFAULT_CONFIG_PATH))?
        } else {
            Self::default()
        };
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                cfg.database_url = url;
            }
        }
        Ok(cfg)
    }

    fn sanitize(&mut self) {
        self.llm.provider = self.llm.provider.trim().to_ascii_lowercase();
        if self.http_timeout_secs == 0 {
            self.http_timeout_secs = default_http_timeout_secs();
        }
        let s = &mut self.scheduler;
        s.fetch_interval_secs = s.fetch_interval_secs.max(60);
        s.poll_interval_secs = s.poll_interval_secs.max(1);
        s.pending_batch = s.pending_batch.clamp(1, 100);
        s.enrich_batch = s.enrich_batch.clamp(1, 100);
        s.startup_backfill_hours = s.startup_backfill_hours.clamp(1, 168);
        if !(-12..=14).contains(&self.digest.utc_offset_hours) {
            self.digest.utc_offset_hours = 7;
        }
        self.digest.window_minutes = self.digest.window_minutes.clamp(1, 24 * 60);
        self.whale.interval_secs = self.whale.interval_secs.max(30);
        self.queue.max_attempts = self.queue.max_attempts.max(1);
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// LLM key, required unless the provider needs none (`mock`) or enrichment is off.
    pub fn llm_api_key(&self) -> Result<Option<String>> {
        let Some(var) = self.llm.key_var() else {
            return Ok(None);
        };
        match resolve_secret(self.llm.api_key.as_deref(), var) {
            Some(k) => Ok(Some(k)),
            None if self.llm.enabled => Err(anyhow!("Missing {var} env var")),
            None => Ok(None),
        }
    }

    pub fn finnhub_key(&self) -> Option<String> {
        resolve_secret(self.providers.finnhub_api_key.as_deref(), "FINNHUB_API_KEY")
    }

    pub fn fmp_key(&self) -> Option<String> {
        resolve_secret(self.providers.fmp_api_key.as_deref(), "FMP_API_KEY")
    }

    pub fn santiment_key(&self) -> Option<String> {
        resolve_secret(self.providers.santiment_api_key.as_deref(), "SANTIMENT_API_KEY")
    }

    pub fn webhook_url(&self) -> Option<String> {
        resolve_secret(self.digest.webhook_url.as_deref(), "DISCORD_WEBHOOK_URL")
    }

    pub fn risk_profile(&self) -> Result<RiskProfile> {
        self.whale.risk_profile.parse()
    }

    pub fn queue_config(&self) -> Result<QueueConfig> {
        let mut qc = QueueConfig {
            max_attempts: self.queue.max_attempts,
            retry_backoff: RetryPolicy::new(self.queue.max_attempts, self.queue.backoff_ms),
            ..QueueConfig::default()
        };
        for (name, n) in &self.queue.concurrency {
            let kind = QueueKind::ALL
                .into_iter()
                .find(|k| k.name() == name.as_str())
                .ok_or_else(|| anyhow!("unknown queue in [queue.concurrency]: {name}"))?;
            qc = qc.with_concurrency(kind, *n);
        }
        Ok(qc)
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let s = &self.scheduler;
        let digest = if self.digest.enabled {
            Some(DigestSchedule {
                utc_offset: offset_hours(self.digest.utc_offset_hours),
                slots: vec![
                    DigestSlot {
                        schedule: ScheduleType::Morning,
                        at: parse_slot(&self.digest.morning)?,
                    },
                    DigestSlot {
                        schedule: ScheduleType::Evening,
                        at: parse_slot(&self.digest.evening)?,
                    },
                ],
                window: chrono::Duration::minutes(self.digest.window_minutes),
                webhook_url: self.webhook_url(),
            })
        } else {
            None
        };
        Ok(SchedulerConfig {
            fetch_interval: Duration::from_secs(s.fetch_interval_secs),
            poll_interval: Duration::from_secs(s.poll_interval_secs),
            pending_batch: s.pending_batch,
            enrich_batch: s.enrich_batch,
            enrichment_enabled: self.llm.enabled,
            startup_backfill_hours: s.startup_backfill_hours,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SourceKind;

    const SAMPLE: &str = r#"
database_url = "sqlite::memory:"
metrics_listen = "127.0.0.1:9100"

[llm]
provider = " OpenAI "
model = "gpt-4o-mini"
api_key = "sk-inline"

[scheduler]
fetch_interval_secs = 5
pending_batch = 500

[digest]
utc_offset_hours = 42
morning = "06:30"
webhook_url = ""

[queue]
max_attempts = 0
concurrency = { enrich = 4 }

[[sources]]
name = "CoinDesk"
kind = "RSS"
url = "https://www.coindesk.com/arc/outboundfeeds/rss/"

[[sources]]
name = "CryptoCompare"
kind = "API"
url = "https://min-api.cryptocompare.com"
enabled = false
"#;

    #[test]
    fn parses_and_sanitizes() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.llm_api_key().unwrap().as_deref(), Some("sk-inline"));
        assert_eq!(cfg.scheduler.fetch_interval_secs, 60);
        assert_eq!(cfg.scheduler.pending_batch, 100);
        assert_eq!(cfg.scheduler.poll_interval_secs, 10);
        assert_eq!(cfg.digest.utc_offset_hours, 7);
        assert_eq!(cfg.queue.max_attempts, 1);
        assert!(cfg.webhook_url().is_none());
        assert_eq!(cfg.metrics_listen.map(|a| a.port()), Some(9100));

        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].kind, SourceKind::Rss);
        assert!(cfg.sources[0].enabled);
        assert!(!cfg.sources[1].enabled);
    }

    #[test]
    fn derived_runtime_configs() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let sched = cfg.scheduler_config().unwrap();
        let digest = sched.digest.unwrap();
        assert_eq!(digest.slots[0].at, NaiveTime::from_hms_opt(6, 30, 0).unwrap());
        assert_eq!(digest.slots[1].at, NaiveTime::from_hms_opt(19, 0, 0).unwrap());
        assert!(sched.enrichment_enabled);

        let qc = cfg.queue_config().unwrap();
        assert_eq!(qc.concurrency.get(&QueueKind::Enrich), Some(&4));

        let bad = PipelineConfig::from_toml_str("[queue]\nconcurrency = { nope = 1 }").unwrap();
        assert!(bad.queue_config().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn env_marker_reads_variables() {
        env::set_var("FINNHUB_API_KEY", "fh-test");
        env::remove_var("FMP_API_KEY");
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.finnhub_key().as_deref(), Some("fh-test"));
        assert_eq!(cfg.fmp_key(), None);
        env::remove_var("FINNHUB_API_KEY");

        env::remove_var("OPENROUTER_API_KEY");
        assert!(cfg.llm_api_key().is_err());
        let mock = PipelineConfig::from_toml_str("[llm]\nprovider = \"mock\"").unwrap();
        assert_eq!(mock.llm_api_key().unwrap(), None);
    }

    #[serial_test::serial]
    #[test]
    fn default_path_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var("DATABASE_URL");

        let cfg = PipelineConfig::load_default().unwrap();
        assert_eq!(cfg.database_url, default_database_url());

        let p = tmp.path().join("custom.toml");
        fs::write(&p, "database_url = \"sqlite::memory:\"").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(PipelineConfig::load_default().unwrap().database_url, "sqlite::memory:");

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(PipelineConfig::load_default().is_err());
        env::remove_var(ENV_CONFIG_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
