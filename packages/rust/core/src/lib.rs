//! Pipeline orchestration core for DealDriver.
//!
//! Every domain runs through a fixed stage graph (scrape, enrich, export)
//! with an optional batch-level CRM import at the end. This crate holds the
//! machinery that makes that safe to run concurrently and to resume:
//!
//! - [`ratelimit`]: token buckets shared by everything that calls an external API
//! - [`pool`]: bounded pool of heavyweight scraping sessions
//! - [`graph`]: the static stage dependency table
//! - [`stages`]: per-stage execution against the injected collaborators
//! - [`scheduler`]: per-item execution that skips committed stages
//! - [`workers`]: bounded worker pool with progress and cancellation
//! - [`dispatch`]: broker-backed distributed execution
//! - [`pipeline`]: the batch orchestrator

pub mod dispatch;
pub mod enrichment;
pub mod export;
pub mod graph;
pub mod import;
pub mod pipeline;
pub mod pool;
pub mod ratelimit;
pub mod scheduler;
pub mod stages;
pub mod workers;

#[cfg(test)]
pub(crate) mod testkit;

pub use tokio_util::sync::CancellationToken;
