//! Read-only admin views over the conformed and gold tiers.
//!
//! One view per entity type (`conformed.<entity>`) and per mart
//! (`gold.<mart>`), returned as Arrow record batches for inspection. Views
//! read committed manifests only and are never on the write path.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use strata_core::storage::StorageBackend;

use crate::aggregate::AggregationEngine;
use crate::config::PipelineConfig;
use crate::conformed::ConformedStore;
use crate::entity::EntityType;
use crate::error::{PipelineError, Result};
use crate::mart::Mart;
use crate::parquet_util;

/// A named admin view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewName {
    /// Conformed entities of one type.
    Conformed(EntityType),
    /// Rows of one mart.
    Gold(Mart),
}

impl std::fmt::Display for ViewName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conformed(entity) => write!(f, "conformed.{entity}"),
            Self::Gold(mart) => write!(f, "gold.{mart}"),
        }
    }
}

impl std::str::FromStr for ViewName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some(("conformed", entity)) => Ok(Self::Conformed(entity.parse()?)),
            Some(("gold", mart)) => Ok(Self::Gold(mart.parse()?)),
            _ => Err(PipelineError::Config {
                message: format!("unknown view '{s}' (expected conformed.<entity> or gold.<mart>)"),
            }),
        }
    }
}

/// Admin query surface.
#[derive(Debug)]
pub struct AdminViews<S> {
    conformed: ConformedStore<S>,
    marts: AggregationEngine<S>,
}

impl<S: StorageBackend> AdminViews<S> {
    /// Creates views over a backend.
    #[must_use]
    pub fn new(storage: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            conformed: ConformedStore::new(Arc::clone(&storage)),
            marts: AggregationEngine::new(storage, config),
        }
    }

    /// Every available view.
    #[must_use]
    pub fn list_views(&self) -> Vec<ViewName> {
        EntityType::ALL
            .into_iter()
            .map(ViewName::Conformed)
            .chain(Mart::ALL.into_iter().map(ViewName::Gold))
            .collect()
    }

    /// Reads a view by name, e.g. `conformed.encounter` or `gold.department`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unknown view, or a storage/decoding error.
    pub async fn read_view(&self, name: &str) -> Result<Vec<RecordBatch>> {
        match name.parse::<ViewName>()? {
            ViewName::Conformed(entity_type) => {
                let manifest = self.conformed.manifest(entity_type).await?.record;
                let mut batches = Vec::with_capacity(manifest.partitions.len());
                for entry in manifest.partitions.values() {
                    let entities = self.conformed.read_partition(entry).await?;
                    batches.push(parquet_util::entity_batch(entity_type, &entities)?);
                }
                Ok(batches)
            }
            ViewName::Gold(mart) => {
                let manifest = self.marts.manifest(mart).await?.record;
                let mut batches = Vec::with_capacity(manifest.partitions.len());
                for entry in manifest.partitions.values() {
                    let rows = self.marts.read_partition(mart, entry).await?;
                    batches.push(parquet_util::mart_batch(mart, &rows)?);
                }
                Ok(batches)
            }
        }
    }
}
