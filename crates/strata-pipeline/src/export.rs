//! Export publisher: atomic per-partition swap into the consumer layout.
//!
//! Consumers read `export/{mart}/month=YYYY-MM/data.parquet`. A new version
//! of a partition is written to `export/_staging/...` and renamed over the
//! published file with a precondition on the version observed just before,
//! so readers see either the old file or the new one. What was published is
//! tracked in `export/{mart}/_published.json` by content hash; republishing
//! identical content changes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use strata_core::partition::PartitionKey;
use strata_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use strata_core::storage_keys::{ExportKey, GoldKey, StorageKey};
use strata_core::{LeaseGuard, RunId};

use crate::aggregate::{MartManifest, MartPartition};
use crate::config::PipelineConfig;
use crate::conformed::parse_partition;
use crate::error::{PipelineError, Result};
use crate::lease;
use crate::mart::Mart;
use crate::metrics;
use crate::progress::{ensure_fresh, ProgressRecord, ProgressStore, Versioned};

/// One published partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPartition {
    /// Consumer-facing path.
    pub path: String,
    /// Content hash of the mart file that was published.
    pub content_hash: String,
    /// Storage version of the published file.
    pub version: String,
    /// When it was swapped in.
    pub published_at: DateTime<Utc>,
}

/// Record of what the export location currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedRecord {
    /// Mart name.
    pub mart: Option<Mart>,
    /// Partition path form to published file.
    #[serde(default)]
    pub partitions: BTreeMap<String, PublishedPartition>,
    /// Fencing token of the last writer.
    #[serde(default)]
    pub fencing_token: u64,
    /// Last change time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressRecord for PublishedRecord {
    fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

/// Outcome of one publish run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    /// Mart published.
    pub mart: Mart,
    /// Partitions swapped in.
    pub published: Vec<PartitionKey>,
    /// Partitions already current.
    pub unchanged: Vec<PartitionKey>,
    /// Partitions removed from the export.
    pub removed: Vec<PartitionKey>,
}

impl ExportResult {
    /// Returns true if the run changed nothing a consumer can observe.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.published.is_empty() && self.removed.is_empty()
    }
}

/// Publishes mart partitions to the export location.
#[derive(Debug)]
pub struct ExportPublisher<S> {
    storage: Arc<S>,
    config: PipelineConfig,
    progress: ProgressStore<S>,
}

impl<S: StorageBackend> ExportPublisher<S> {
    /// Creates a publisher.
    #[must_use]
    pub fn new(storage: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            progress: ProgressStore::new(Arc::clone(&storage)),
            storage,
            config,
        }
    }

    /// Loads the publication record of a mart.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn published(&self, mart: Mart) -> Result<Versioned<PublishedRecord>> {
        let (mut record, version) = match self
            .progress
            .load::<PublishedRecord>(ExportKey::published(mart.as_str()).path())
            .await?
        {
            Some((record, version)) => (record, Some(version)),
            None => (PublishedRecord::default(), None),
        };
        record.mart = Some(mart);
        Ok(Versioned { record, version })
    }

    /// Publishes the current mart contents.
    ///
    /// # Errors
    ///
    /// - `ExportRaceCondition` if a partition swap kept losing to a
    ///   concurrent writer.
    /// - `LeaseBusy` if another run is publishing this mart.
    #[tracing::instrument(skip(self), fields(mart = %mart))]
    pub async fn publish(&self, mart: Mart) -> Result<ExportResult> {
        let run_id = RunId::generate();
        let started = std::time::Instant::now();

        let guard = lease::acquire(&self.storage, "export", mart.as_str(), &self.config, run_id).await?;
        let result = self.publish_locked(&guard, mart).await;
        lease::release(guard, "export", mart.as_str()).await;

        metrics::record_stage_outcome("export", started, &result);
        result
    }

    async fn publish_locked(&self, guard: &LeaseGuard<S>, mart: Mart) -> Result<ExportResult> {
        let mut record = self.published(mart).await?;
        ensure_fresh(
            ExportKey::published(mart.as_str()).path(),
            record.record.fencing_token,
            guard.fencing_token(),
        )?;
        let gold: MartManifest = self
            .progress
            .load::<MartManifest>(GoldKey::manifest(mart.as_str()).path())
            .await?
            .map(|(manifest, _)| manifest)
            .unwrap_or_default();

        let mut result = ExportResult {
            mart,
            published: Vec::new(),
            unchanged: Vec::new(),
            removed: Vec::new(),
        };

        for (name, source) in &gold.partitions {
            let partition = parse_partition(name)?;
            let target = ExportKey::partition_file(mart.as_str(), &partition);
            let current = record.record.partitions.get(name);
            let exists = self.storage.head(target.path()).await?.is_some();
            if exists && current.is_some_and(|p| p.content_hash == source.content_hash) {
                result.unchanged.push(partition);
                continue;
            }

            let version = self.swap_in(mart, &partition, source).await?;
            record.record.partitions.insert(
                name.clone(),
                PublishedPartition {
                    path: target.path().to_string(),
                    content_hash: source.content_hash.clone(),
                    version,
                    published_at: Utc::now(),
                },
            );
            result.published.push(partition);
        }

        let stale: Vec<String> = record
            .record
            .partitions
            .keys()
            .filter(|name| !gold.partitions.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(entry) = record.record.partitions.remove(&name) {
                self.storage.delete(&entry.path).await?;
            }
            result.removed.push(parse_partition(&name)?);
        }

        if !result.is_noop() {
            lease::ensure_held(guard, "export", mart.as_str()).await?;
            record.record.mart = Some(mart);
            record.record.fencing_token = guard.fencing_token().sequence();
            record.record.updated_at = Some(Utc::now());
            self.progress
                .commit(
                    ExportKey::published(mart.as_str()).path(),
                    &record.record,
                    record.version.take(),
                )
                .await?;
        }

        metrics::record_published(mart.as_str(), result.published.len() as u64);
        tracing::info!(
            mart = %mart,
            published = result.published.len(),
            unchanged = result.unchanged.len(),
            removed = result.removed.len(),
            "export published"
        );
        Ok(result)
    }

    /// Stages a partition and renames it over the published file.
    async fn swap_in(&self, mart: Mart, partition: &PartitionKey, source: &MartPartition) -> Result<String> {
        let bytes = self.storage.get(&source.path).await?;
        let target = ExportKey::partition_file(mart.as_str(), partition);
        let attempts = self.config.export_retry_limit.max(1);

        for attempt in 1..=attempts {
            let staging = ExportKey::staging(mart.as_str(), partition, &Ulid::new().to_string());
            self.storage
                .put(staging.path(), bytes.clone(), WritePrecondition::None)
                .await?;
            let observed = self.storage.head(target.path()).await?.map(|m| m.version);
            match self
                .storage
                .rename(staging.path(), target.path(), WritePrecondition::from_observed(observed))
                .await?
            {
                WriteResult::Success { version } => return Ok(version),
                WriteResult::PreconditionFailed { .. } => {
                    self.storage.delete(staging.path()).await?;
                    metrics::record_cas_retry("export_swap");
                    tracing::warn!(
                        mart = %mart,
                        partition = %partition,
                        attempt,
                        "export partition changed during swap, restaging"
                    );
                }
            }
        }

        Err(PipelineError::ExportRaceCondition {
            mart: mart.to_string(),
            partition: partition.to_string(),
        })
    }
}
