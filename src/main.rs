//! cryptowire worker entrypoint.
//! Loads config, opens the store, wires providers into the job pipeline and runs the
//! scheduler (plus the optional whale poller) until Ctrl-C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cryptowire::cluster::{self, ClusterQuery};
use cryptowire::config::PipelineConfig;
use cryptowire::digest::prices::CoinGeckoPrices;
use cryptowire::digest::DigestGenerator;
use cryptowire::enrich::llm::build_provider;
use cryptowire::enrich::onchain::{CachedMetrics, SantimentProvider};
use cryptowire::enrich::sentiment::{FinnhubProvider, FmpProvider};
use cryptowire::enrich::Enricher;
use cryptowire::ingest::article::HttpPageFetcher;
use cryptowire::ingest::config::load_allowlist_default;
use cryptowire::ingest::http_client;
use cryptowire::ingest::providers::HttpSourceFactory;
use cryptowire::jobs::scheduler::offset_hours;
use cryptowire::jobs::{Broker, Pipeline, Scheduler};
use cryptowire::store::Store;
use cryptowire::whale::source::CommandSource;
use cryptowire::whale::WhaleService;

/// `RUST_LOG` wins, then `LOG_LEVEL`, then `info`. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

/// SQLite creates the file but not its directory.
fn ensure_db_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default()?;
    cryptowire::metrics::init(cfg.metrics_listen)?;

    ensure_db_dir(&cfg.database_url)?;
    let store = Store::connect(&cfg.database_url)
        .await
        .context("opening database")?;
    for spec in &cfg.sources {
        store
            .upsert_source(spec)
            .await
            .with_context(|| format!("registering source {}", spec.name))?;
    }

    let timeout = cfg.http_timeout();
    let http = http_client(&cfg.user_agent, timeout)?;
    let llm = build_provider(&cfg.llm.provider, &cfg.llm.model, cfg.llm_api_key()?, http.clone())?;

    let santiment = Arc::new(SantimentProvider::new(http.clone(), cfg.santiment_key()));
    let enricher = Enricher::new(llm.clone())
        .with_sentiment_provider(Arc::new(FinnhubProvider::new(http.clone(), cfg.finnhub_key())))
        .with_sentiment_provider(Arc::new(FmpProvider::new(http.clone(), cfg.fmp_key())))
        .with_metrics_provider(Arc::new(CachedMetrics::new(santiment)));

    let digest = DigestGenerator::new(store.clone(), llm, http.clone(), offset_hours(cfg.digest.utc_offset_hours))
        .with_prices(Arc::new(CoinGeckoPrices::new(http.clone())));

    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(HttpSourceFactory::new(http.clone(), timeout)),
        Arc::new(HttpPageFetcher::new(http.clone(), timeout)),
        Arc::new(enricher),
        load_allowlist_default()?,
    )
    .with_digest(Arc::new(digest));

    let (broker, workers) = Broker::start(cfg.queue_config()?, Arc::new(pipeline));
    let scheduler = Scheduler::new(store.clone(), broker.clone(), cfg.scheduler_config()?).spawn();

    let clusters = cluster::spawn_report(store.clone(), ClusterQuery::default(), Duration::from_secs(3_600));

    let whale = if cfg.whale.enabled {
        let source = if cfg.whale.command.is_empty() {
            CommandSource::default_command()
        } else {
            CommandSource::new(cfg.whale.command.clone(), Duration::from_secs(cfg.whale.timeout_secs))?
        };
        let service = WhaleService::new(Arc::new(source), store.clone(), cfg.risk_profile()?)
            .with_retention(cfg.whale.retain_snapshots);
        Some(service.spawn(Duration::from_secs(cfg.whale.interval_secs)))
    } else {
        None
    };

    info!(
        sources = cfg.sources.len(),
        llm_provider = %cfg.llm.provider,
        enrichment = cfg.llm.enabled,
        whale = cfg.whale.enabled,
        "cryptowire worker started"
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!(pending = broker.pending(), "shutdown requested");

    scheduler.abort();
    clusters.abort();
    if let Some(handle) = whale {
        handle.abort();
    }
    broker.shutdown();
    if tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(workers))
        .await
        .is_err()
    {
        warn!("workers did not finish within 30s");
    }
    info!("bye");
    Ok(())
}
