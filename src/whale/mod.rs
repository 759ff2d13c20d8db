//! # Whale trader scoring
//!
//! Pulls a ranked list of wallets from an external source, maps heterogeneous records to
//! [`TraderRecord`], scores them on a 0-100 composite, filters by risk profile and persists the
//! top five as a snapshot with score-proportional allocations.
//!
//! Sub-scores are linear clamp-and-rescale against fixed bands and default to 50 when the
//! field is missing:
//!
//! | component   | weight | band                      |
//! |-------------|--------|---------------------------|
//! | pnl rank    | 0.20   | `101 - rank` over [1,100] |
//! | ROI         | 0.20   | [0, 700]                  |
//! | PnL size    | 0.10   | [0, 3 000 000]            |
//! | win rate    | 0.20   | [0, 100]                  |
//! | consistency | 0.15   | label lookup              |
//! | hold time   | 0.05   | hours over [1, 72]        |
//! | drawdown    | 0.10   | `100 - dd%` over [0, 100] |

pub mod source;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::{NewWhaleSnapshot, Store, WhaleTraderRow};
use source::{parse_payload, RankingSource};

pub const TOP_N: usize = 5;
pub const SNAPSHOT_RETENTION: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Moderate => "moderate",
            RiskProfile::Aggressive => "aggressive",
        }
    }

    /// Allowed consistency labels per profile (substring match, case-insensitive).
    pub fn admits(&self, consistency: Option<&str>) -> bool {
        let label = consistency.unwrap_or("").to_uppercase();
        let allowed: &[&str] = match self {
            RiskProfile::Conservative => &["ELITE", "RELIABLE"],
            RiskProfile::Moderate => &["ELITE", "RELIABLE", "STREAKY"],
            RiskProfile::Aggressive => &["ELITE", "RELIABLE", "BALANCED", "STREAKY"],
        };
        allowed.iter().any(|a| label.contains(a))
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(RiskProfile::Conservative),
            "moderate" => Ok(RiskProfile::Moderate),
            "aggressive" => Ok(RiskProfile::Aggressive),
            other => anyhow::bail!("unknown risk profile: {other}"),
        }
    }
}

/// Canonical wallet record. Numeric fields are `None` when absent or unparsable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraderRecord {
    pub wallet_address: String,
    pub rank: Option<f64>,
    pub pnl_rank: Option<f64>,
    pub win_rate: Option<f64>,
    pub consistency: Option<String>,
    pub hold_time_hours: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
    pub roi: Option<f64>,
    pub pnl: Option<f64>,
}

/// Finite number or numeric string.
pub fn lenient_number(v: Option<&Value>) -> Option<f64> {
    let n = match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn first<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| raw.get(*k)).find(|v| !v.is_null())
}

fn first_text(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
}

/// Map one raw record; `None` when it has no wallet address.
pub fn normalize_trader(raw: &Value) -> Option<TraderRecord> {
    let wallet_address = first_text(raw, &["walletAddress", "wallet", "address"])?;
    let hold_time_hours = lenient_number(first(raw, &["holdTimeHours", "hold_time_hours"])).or_else(|| {
        lenient_number(raw.get("averageHoldTimeSeconds")).map(|s| s / 3600.0)
    });
    let max_drawdown_pct = lenient_number(first(raw, &["maxDrawdownPct", "max_drawdown_pct"]))
        .or_else(|| lenient_number(raw.get("maxDrawdown")).map(f64::abs));
    let rank = lenient_number(first(raw, &["rank", "position"]));

    Some(TraderRecord {
        wallet_address,
        rank,
        pnl_rank: lenient_number(raw.get("pnlRank")).or(rank),
        win_rate: lenient_number(first(raw, &["winRate", "win_rate"])),
        consistency: first_text(raw, &["consistency", "consistencyLabel", "tcsLabel"]),
        hold_time_hours,
        max_drawdown_pct,
        roi: lenient_number(first(raw, &["returnOnInvestment", "roi"])),
        pnl: lenient_number(first(raw, &["profitAndLoss", "pnl"])),
    })
}

/// Clamp into `[min, max]` and rescale to 0-100; 50 when absent or the band is empty.
pub fn normalize_component(value: Option<f64>, min: f64, max: f64) -> f64 {
    match value {
        Some(v) if max > min => ((v.clamp(min, max) - min) / (max - min)) * 100.0,
        _ => 50.0,
    }
}

pub fn consistency_score(label: Option<&str>) -> f64 {
    let v = label.unwrap_or("").to_uppercase();
    if v.contains("ELITE") {
        100.0
    } else if v.contains("RELIABLE") {
        80.0
    } else if v.contains("BALANCED") {
        60.0
    } else if v.contains("STREAKY") {
        55.0
    } else {
        40.0
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Composite score in `[0, 100]`, rounded to two decimals.
pub fn whale_score(t: &TraderRecord) -> f64 {
    let pnl_rank = normalize_component(t.pnl_rank.map(|r| 101.0 - r), 1.0, 100.0);
    let roi = normalize_component(t.roi, 0.0, 700.0);
    let pnl_size = normalize_component(t.pnl, 0.0, 3_000_000.0);
    let win_rate = normalize_component(t.win_rate, 0.0, 100.0);
    let consistency = consistency_score(t.consistency.as_deref());
    let hold = normalize_component(t.hold_time_hours, 1.0, 72.0);
    let drawdown = normalize_component(t.max_drawdown_pct.map(|d| 100.0 - d), 0.0, 100.0);

    round2(
        0.20 * pnl_rank
            + 0.20 * roi
            + 0.10 * pnl_size
            + 0.20 * win_rate
            + 0.15 * consistency
            + 0.05 * hold
            + 0.10 * drawdown,
    )
}

/// Score, filter by `profile`, keep the best `n` and assign `score / Σscore × 100` allocations.
/// Stored rank is the source rank, or the 1-based position in the source list when absent.
pub fn select_top(records: &[TraderRecord], profile: RiskProfile, n: usize) -> Vec<WhaleTraderRow> {
    let mut scored: Vec<(usize, f64, &TraderRecord)> = records
        .iter()
        .enumerate()
        .filter(|(_, t)| profile.admits(t.consistency.as_deref()))
        .map(|(idx, t)| (idx, whale_score(t), t))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(n);

    let total: f64 = scored.iter().map(|(_, s, _)| s).sum();
    scored
        .into_iter()
        .map(|(idx, score, t)| WhaleTraderRow {
            wallet_address: t.wallet_address.clone(),
            rank: t.rank.map(|r| r.round() as i64).unwrap_or(idx as i64 + 1),
            score,
            allocation_pct: (total > 0.0).then(|| round2(score / total * 100.0)),
            consistency: t.consistency.clone(),
            win_rate: t.win_rate,
            roi: t.roi,
            pnl: t.pnl,
            pnl_rank: t.pnl_rank,
            hold_time_hours: t.hold_time_hours,
            max_drawdown_pct: t.max_drawdown_pct,
        })
        .collect()
}

/// Polls the ranking source and persists one snapshot per run.
pub struct WhaleService {
    source: Arc<dyn RankingSource>,
    store: Store,
    profile: RiskProfile,
    timeframe: String,
    retain: i64,
}

impl WhaleService {
    pub fn new(source: Arc<dyn RankingSource>, store: Store, profile: RiskProfile) -> Self {
        Self {
            source,
            store,
            profile,
            timeframe: "30d".to_string(),
            retain: SNAPSHOT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retain: i64) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// One poll: fetch, score, persist. Returns the new snapshot id.
    pub async fn run_once(&self) -> Result<i64> {
        let started = std::time::Instant::now();
        let text = self.source.fetch_raw().await?;
        let payload = parse_payload(&text)?;
        let records: Vec<TraderRecord> = payload.records.iter().filter_map(normalize_trader).collect();
        let selected = select_top(&records, self.profile, TOP_N);

        let snapshot = NewWhaleSnapshot {
            scan_time: Utc::now(),
            timeframe: self.timeframe.clone(),
            risk_profile: self.profile.to_string(),
            candidates: records.len() as i64,
            raw_payload: Some(payload.raw.to_string()),
            traders: selected,
        };
        let id = self
            .store
            .persist_whale_snapshot(&snapshot, self.retain)
            .await
            .context("persisting whale snapshot")?;

        counter!("whale_snapshots_total").increment(1);
        info!(
            snapshot_id = id,
            candidates = snapshot.candidates,
            selected = snapshot.traders.len(),
            risk_profile = %self.profile,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stored whale snapshot"
        );
        Ok(id)
    }

    /// Poll every `interval` until the task is aborted. Failures are logged and retried on the
    /// next tick.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = ?e, source = %self.source.describe(), "whale poll failed");
                }
            }
        })
    }
}
