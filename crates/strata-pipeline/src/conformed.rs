//! Conformed-tier storage: partition snapshots behind a CAS manifest.
//!
//! Each entity type has a manifest at `conformed/{entity}/manifest.json`
//! listing the current snapshot of every partition. Snapshots are immutable
//! files written at the manifest version that introduced them; a batch only
//! becomes visible when the manifest swap succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use strata_core::partition::PartitionKey;
use strata_core::storage::{StorageBackend, WritePrecondition};
use strata_core::storage_keys::{ConformedKey, StorageKey};

use crate::entity::{EntityRecord, EntityType};
use crate::error::{PipelineError, Result};
use crate::progress::{ProgressRecord, ProgressStore, Versioned};

/// One conformed entity, unique per natural key within its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformedEntity {
    /// Natural key.
    pub natural_key: String,
    /// Merged attributes.
    pub attributes: EntityRecord,
    /// Event time of the latest record merged into this entity.
    pub valid_from: DateTime<Utc>,
    /// Ingestion time of that record.
    pub ingested_at: DateTime<Utc>,
    /// Source offset of that record; final ordering tie-break.
    #[serde(default)]
    pub source_offset: u64,
    /// Watermark of the run that last changed this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_watermark: Option<DateTime<Utc>>,
}

impl ConformedEntity {
    /// Ordering position of the record this entity was last merged from.
    #[must_use]
    pub fn order_key(&self) -> (DateTime<Utc>, DateTime<Utc>, u64) {
        (self.valid_from, self.ingested_at, self.source_offset)
    }

    /// Partition this entity belongs to.
    #[must_use]
    pub fn partition(&self) -> PartitionKey {
        self.attributes.partition(self.valid_from)
    }
}

/// Manifest entry for one partition snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionEntry {
    /// Snapshot path.
    pub path: String,
    /// Entities in the snapshot.
    pub row_count: u64,
    /// Manifest version that wrote the snapshot.
    pub version: u64,
    /// `sha256:` hash of the snapshot bytes.
    pub content_hash: String,
}

/// Commit point of an entity type's conformed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConformedManifest {
    /// Entity type.
    pub entity_type: Option<EntityType>,
    /// Incremented on every commit that changes a partition.
    pub version: u64,
    /// Partition path form to current snapshot.
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionEntry>,
    /// Fencing token of the last writer.
    #[serde(default)]
    pub fencing_token: u64,
    /// Last commit time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConformedManifest {
    /// Returns the next manifest version.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.version + 1
    }

    /// Total entities across partitions.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.partitions.values().map(|p| p.row_count).sum()
    }
}

impl ProgressRecord for ConformedManifest {
    fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

/// Body of a partition snapshot file, sorted by natural key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Entities in the partition.
    pub entities: Vec<ConformedEntity>,
}

/// Entities grouped by partition.
pub type PartitionedEntities = BTreeMap<PartitionKey, Vec<ConformedEntity>>;

/// Reads and writes the conformed tier.
#[derive(Debug)]
pub struct ConformedStore<S> {
    storage: Arc<S>,
    progress: ProgressStore<S>,
}

impl<S> Clone for ConformedStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            progress: self.progress.clone(),
        }
    }
}

impl<S: StorageBackend> ConformedStore<S> {
    /// Creates a store over a backend.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            progress: ProgressStore::new(Arc::clone(&storage)),
            storage,
        }
    }

    /// Loads an entity type's manifest (empty if none was committed).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt manifest.
    pub async fn manifest(&self, entity_type: EntityType) -> Result<Versioned<ConformedManifest>> {
        let path = ConformedKey::manifest(entity_type.as_str());
        let (mut record, version) = match self.progress.load::<ConformedManifest>(path.path()).await? {
            Some((record, version)) => (record, Some(version)),
            None => (ConformedManifest::default(), None),
        };
        record.entity_type = Some(entity_type);
        Ok(Versioned { record, version })
    }

    /// Reads one partition snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt snapshot.
    pub async fn read_partition(&self, entry: &PartitionEntry) -> Result<Vec<ConformedEntity>> {
        let bytes = self.storage.get(&entry.path).await?;
        let snapshot: PartitionSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::Serialization {
                message: format!("parse {}: {e}", entry.path),
            })?;
        Ok(snapshot.entities)
    }

    /// Reads every partition listed in a manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if a partition key or snapshot cannot be read.
    pub async fn read_all(&self, manifest: &ConformedManifest) -> Result<PartitionedEntities> {
        let mut out = PartitionedEntities::new();
        for (partition, entry) in &manifest.partitions {
            let key = parse_partition(partition)?;
            out.insert(key, self.read_partition(entry).await?);
        }
        Ok(out)
    }

    /// Reads the committed entities of a type, keyed by natural key.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn entities_by_key(&self, entity_type: EntityType) -> Result<BTreeMap<String, ConformedEntity>> {
        let manifest = self.manifest(entity_type).await?.record;
        Ok(self
            .read_all(&manifest)
            .await?
            .into_values()
            .flatten()
            .map(|e| (e.natural_key.clone(), e))
            .collect())
    }

    /// Writes a snapshot for `version`. Returns its manifest entry.
    ///
    /// Snapshot paths are a function of partition and version, so a retried
    /// commit overwrites its own orphaned snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be written.
    pub async fn write_partition(
        &self,
        entity_type: EntityType,
        partition: &PartitionKey,
        version: u64,
        entities: Vec<ConformedEntity>,
    ) -> Result<PartitionEntry> {
        let row_count = entities.len() as u64;
        let bytes = encode_snapshot(entities)?;
        let content_hash = content_hash(&bytes);
        let key = ConformedKey::snapshot(entity_type.as_str(), partition, version);
        self.storage
            .put(key.path(), bytes, WritePrecondition::None)
            .await?;
        Ok(PartitionEntry {
            path: key.path().to_string(),
            row_count,
            version,
            content_hash,
        })
    }

    /// Commits a manifest if it is unchanged since `expected`.
    ///
    /// # Errors
    ///
    /// `MergeConflict` if another writer committed first; `StaleWriter` if
    /// the stored manifest carries a newer fencing token.
    pub async fn commit_manifest(
        &self,
        manifest: &ConformedManifest,
        expected: Option<String>,
    ) -> Result<String> {
        let entity_type = manifest.entity_type.ok_or_else(|| PipelineError::Config {
            message: "conformed manifest has no entity type".into(),
        })?;
        self.progress
            .commit(ConformedKey::manifest(entity_type.as_str()).path(), manifest, expected)
            .await
    }
}

/// Hash of the snapshot a partition would have, without writing it.
///
/// # Errors
///
/// Returns an error if the entities cannot be serialized.
pub fn snapshot_hash(entities: &[ConformedEntity]) -> Result<String> {
    Ok(content_hash(&encode_snapshot(entities.to_vec())?))
}

fn encode_snapshot(mut entities: Vec<ConformedEntity>) -> Result<Bytes> {
    entities.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
    Ok(Bytes::from(serde_json::to_vec(&PartitionSnapshot { entities })?))
}

fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

pub(crate) fn parse_partition(partition: &str) -> Result<PartitionKey> {
    PartitionKey::parse(partition).map_err(|e| PipelineError::Serialization {
        message: format!("invalid partition {partition}: {e}"),
    })
}
