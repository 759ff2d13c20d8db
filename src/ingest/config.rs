// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dedup::Allowlist;

const ENV_PATH: &str = "CRYPTOWIRE_ALLOWLIST_PATH";

/// Aggregator-API sources that are worth ingesting when no allowlist file is present.
pub const DEFAULT_ALLOWED_SOURCES: &[&str] = &[
    "yahoo finance",
    "cnbc",
    "beincrypto",
    "the defiant",
    "thedefiant",
    "seekingalpha",
    "seeking alpha",
    "wu blockchain",
    "wublockchain",
    "x.com",
    "twitter",
];

/// Load an allowlist from an explicit path. Supports TOML (`sources = [...]`) or a JSON array.
pub fn load_allowlist_from(path: &Path) -> Result<Allowlist> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading allowlist from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    Ok(Allowlist::new(parse_allowlist(&content, ext.as_str())?))
}

/// Load the allowlist using env var + fallbacks:
/// 1) $CRYPTOWIRE_ALLOWLIST_PATH
/// 2) config/allowlist.toml
/// 3) config/allowlist.json
/// 4) built-in `DEFAULT_ALLOWED_SOURCES`
pub fn load_allowlist_default() -> Result<Allowlist> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_allowlist_from(&pb);
        }
        return Err(anyhow!("{ENV_PATH} points to non-existent path"));
    }
    let toml_p = PathBuf::from("config/allowlist.toml");
    if toml_p.exists() {
        return load_allowlist_from(&toml_p);
    }
    let json_p = PathBuf::from("config/allowlist.json");
    if json_p.exists() {
        return load_allowlist_from(&json_p);
    }
    Ok(Allowlist::new(
        DEFAULT_ALLOWED_SOURCES.iter().map(|s| s.to_string()),
    ))
}

#[derive(serde::Deserialize)]
struct TomlList {
    sources: Vec<String>,
}

/// The extension picks the format; anything else is tried as JSON, then TOML.
fn parse_allowlist(s: &str, ext: &str) -> Result<Vec<String>> {
    match ext {
        "json" => serde_json::from_str(s).context("parsing allowlist JSON"),
        "toml" => Ok(toml::from_str::<TomlList>(s).context("parsing allowlist TOML")?.sources),
        _ => serde_json::from_str::<Vec<String>>(s)
            .ok()
            .or_else(|| toml::from_str::<TomlList>(s).ok().map(|l| l.sources))
            .ok_or_else(|| anyhow!("unsupported allowlist format")),
    }
}
