use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder.
///
/// With `listen` set, the exporter serves the exposition format on that address; without it
/// the recorder is still installed so counters stay cheap and consistent.
pub fn init(listen: Option<SocketAddr>) -> Result<()> {
    let builder = PrometheusBuilder::new();
    match listen {
        Some(addr) => builder
            .with_http_listener(addr)
            .install()
            .context("prometheus: install exporter")?,
        None => {
            builder
                .install_recorder()
                .context("prometheus: install recorder")?;
        }
    }
    describe();
    crate::ingest::ensure_metrics_described();
    gauge!("pipeline_up").set(1.0);
    Ok(())
}

/// Series that are not described next to their emitters.
fn describe() {
    describe_gauge!("pipeline_up", "1 while the worker process is running.");
    describe_counter!("whale_snapshots_total", "Whale ranking snapshots persisted.");
    describe_counter!("digest_runs_total", "Digest generations, by outcome (llm or fallback).");
}
