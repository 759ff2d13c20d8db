// src/lib.rs
// Library surface shared by the worker binary and the integration tests.

pub mod config;
pub mod metrics;
pub mod ratelimit;
pub mod retry;
pub mod store;

// Ingestion: source adapters, article fetch, dedup and noise filtering
pub mod dedup;
pub mod ingest;

// Enrichment and derived views
pub mod cluster;
pub mod digest;
pub mod enrich;
pub mod whale;

// Background execution and delivery
pub mod jobs;
pub mod notify;

// ---- Re-exports for the common entry points ----
pub use crate::config::PipelineConfig;
pub use crate::jobs::{Broker, Pipeline, Scheduler};
pub use crate::store::Store;
