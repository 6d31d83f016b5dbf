//! # strata-pipeline
//!
//! Incremental, idempotent stages that move healthcare events from their
//! sources through three storage tiers:
//!
//! - **Raw**: append-only JSON Lines batches, one directory per source and
//!   ingestion hour, landed by the [`RawIngestor`] behind a per-source cursor
//! - **Conformed**: one current row per natural key, kept by the
//!   [`ConformanceTransformer`] as immutable partition snapshots behind a
//!   compare-and-swap manifest
//! - **Gold**: monthly Parquet marts rebuilt by the [`AggregationEngine`]
//!   for affected partitions only, then swapped into `export/` by the
//!   [`ExportPublisher`]
//!
//! Every stage is single-writer per scope (a storage lease with a fencing
//! token), advances its progress marker only after its outputs are durable,
//! and is safe to re-run: replaying the same inputs changes nothing.
//!
//! ## Storage Layout
//!
//! ```text
//! raw/{source}/date=YYYY-MM-DD/hour=HH/{first}-{last}.jsonl
//! conformed/{entity}/manifest.json
//! conformed/{entity}/{partition}/v{version}.json
//! gold/{mart}/manifest.json
//! gold/{mart}/month=YYYY-MM/part-{hash}.parquet
//! export/{mart}/month=YYYY-MM/data.parquet
//! quarantine/{stage}/{scope}/{record_hash}.json
//! state/{cursors,watermarks,marts}/...
//! locks/{scope}/{name}.lock.json
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_core::MemoryBackend;
//! use strata_pipeline::{MemoryEventSource, Pipeline, PipelineConfig};
//!
//! let source = Arc::new(MemoryEventSource::new("encounters"));
//! let pipeline = Pipeline::new(Arc::new(MemoryBackend::new()), PipelineConfig::default())
//!     .with_source(source);
//! let report = pipeline.run_once().await;
//! assert!(report.is_success());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod config;
pub mod conform;
pub mod conformed;
pub mod entity;
pub mod error;
pub mod export;
mod lease;
pub mod mart;
pub mod metrics;
pub mod parquet_util;
pub mod pipeline;
pub mod progress;
pub mod quarantine;
pub mod raw;
pub mod reference;
pub mod source;
pub mod views;

pub use aggregate::{AggregateResult, AggregationEngine, MartManifest, MartPartition};
pub use config::PipelineConfig;
pub use conform::{ConformResult, ConformanceTransformer, UpsertOutcome};
pub use conformed::{ConformedEntity, ConformedManifest, ConformedStore};
pub use entity::{EntityRecord, EntityType};
pub use error::{PipelineError, Result, ViolationKind};
pub use export::{ExportPublisher, ExportResult, PublishedRecord};
pub use mart::{AggregateRow, Mart};
pub use pipeline::{Pipeline, RunReport, StageOutcome, StageStatus};
pub use progress::{Cursor, MartProgress, ProgressStore, Watermark};
pub use quarantine::{QuarantineEntry, QuarantineReason, QuarantineSink, StorageQuarantineSink};
pub use raw::{IngestResult, RawIngestor, RawRecord, RawTier};
pub use reference::{JsonFileReferenceLoader, MemoryReferenceLoader, ReferenceLoader, ReferenceRow};
pub use source::{EventSource, JsonLinesSource, MemoryEventSource, SourceBatch, SourceRecord};
pub use views::{AdminViews, ViewName};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::entity::EntityType;
    pub use crate::error::{PipelineError, Result};
    pub use crate::mart::Mart;
    pub use crate::pipeline::{Pipeline, RunReport};
    pub use crate::reference::ReferenceLoader;
    pub use crate::source::EventSource;
}
