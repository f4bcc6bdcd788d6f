//! Medallion ETL
//!
//! Batch pipeline landing source data in three warehouse layers:
//!
//! - **bronze**: raw records from the HTTP APIs, the MongoDB stock collection and the
//!   remote sales database, keyed on a content hash
//! - **silver**: typed and deduplicated entities keyed on business keys
//! - **gold**: reporting tables (unsold products, stock availability, enriched sales)
//!
//! The [`orchestrator::PipelineOrchestrator`] runs the layers in order with retries and
//! records each run in the execution log; the [`scheduler::PipelineScheduler`] repeats
//! that on a fixed interval.
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod execution_log;
pub mod extract;
pub mod layers;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod sink;

pub use config::PipelineConfig;
pub use error::{EtlError, ExtractKind, Result, WriteKind};
pub use models::{Layer, LayerTarget, LoadSummary, MergeKey, WriteMode};
pub use orchestrator::{PipelineOrchestrator, PipelineState};
