//! Durable progress markers: cursors, watermarks, and mart progress.
//!
//! Each marker is a small JSON record with a single writer at a time (held
//! by a run lease). Commits are compare-and-swap against the version the
//! run observed when it started, and additionally fenced: a record whose
//! stored fencing token is newer than the committing run's token is never
//! overwritten.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use strata_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use strata_core::storage_keys::{StateKey, StorageKey};
use strata_core::FencingToken;

use crate::entity::EntityType;
use crate::error::{PipelineError, Result};

/// A progress record that remembers its last writer's fencing token.
pub trait ProgressRecord: Serialize + DeserializeOwned + Send + Sync {
    /// Token of the run that last committed this record.
    fn fencing_token(&self) -> u64;
}

/// A record together with the storage version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// The record (default value if it did not exist).
    pub record: T,
    /// Version token, `None` if the record did not exist.
    pub version: Option<String>,
}

/// An ingestion batch recorded before its raw files are written.
///
/// A retry after a crash reuses the same offset range and ingestion time,
/// so the batch lands in the same files instead of new ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    /// First offset of the batch.
    pub from_offset: u64,
    /// Offset after the last record of the batch.
    pub to_offset: u64,
    /// Ingestion timestamp stamped on every record of the batch.
    pub ingested_at: DateTime<Utc>,
}

/// Per-source read progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Source identifier.
    pub source_id: String,
    /// Next offset to read; raw files below it are committed.
    pub offset: u64,
    /// Content fingerprint of the last reference load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Batch in flight, if the last run did not finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingBatch>,
    /// Fencing token of the last writer.
    #[serde(default)]
    pub fencing_token: u64,
    /// Last commit time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressRecord for Cursor {
    fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

/// Per-entity-type high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Entity type.
    pub entity_type: Option<EntityType>,
    /// Latest event time observed in a committed batch.
    pub max_observed_event_time: Option<DateTime<Utc>>,
    /// Source cursor offset whose raw files have all been conformed.
    #[serde(default)]
    pub source_offset: u64,
    /// Fencing token of the last writer.
    #[serde(default)]
    pub fencing_token: u64,
    /// Last commit time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Watermark {
    /// Advances to `observed` if it is later. Returns true if it moved.
    pub fn advance(&mut self, observed: Option<DateTime<Utc>>) -> bool {
        match (self.max_observed_event_time, observed) {
            (_, None) => false,
            (Some(current), Some(candidate)) if candidate <= current => false,
            (_, Some(candidate)) => {
                self.max_observed_event_time = Some(candidate);
                true
            }
        }
    }

    /// Lower bound of the reprocessing window for a grace period.
    #[must_use]
    pub fn window_start(since: Option<DateTime<Utc>>, grace: chrono::Duration) -> Option<DateTime<Utc>> {
        since.and_then(|ts| ts.checked_sub_signed(grace))
    }
}

impl ProgressRecord for Watermark {
    fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

/// Conformed partition versions a mart was last built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MartProgress {
    /// Mart name.
    pub mart: String,
    /// Entity type -> partition -> conformed partition version.
    #[serde(default)]
    pub source_versions: BTreeMap<EntityType, BTreeMap<String, u64>>,
    /// Fencing token of the last writer.
    #[serde(default)]
    pub fencing_token: u64,
    /// Last commit time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressRecord for MartProgress {
    fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

/// Reads and commits progress records.
#[derive(Debug)]
pub struct ProgressStore<S> {
    storage: Arc<S>,
}

impl<S> Clone for ProgressStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageBackend> ProgressStore<S> {
    /// Creates a store over a backend.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Loads a record and the version it was read at.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or an unparsable record.
    pub async fn load<T: ProgressRecord>(&self, path: &str) -> Result<Option<(T, String)>> {
        let Some(meta) = self.storage.head(path).await? else {
            return Ok(None);
        };
        let bytes = match self.storage.get(path).await {
            Ok(bytes) => bytes,
            Err(strata_core::Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&bytes).map_err(|e| PipelineError::Serialization {
            message: format!("parse {path}: {e}"),
        })?;
        Ok(Some((record, meta.version)))
    }

    async fn load_or_default<T: ProgressRecord + Default>(&self, path: &str) -> Result<Versioned<T>> {
        Ok(match self.load(path).await? {
            Some((record, version)) => Versioned {
                record,
                version: Some(version),
            },
            None => Versioned {
                record: T::default(),
                version: None,
            },
        })
    }

    /// Commits `record` if the stored version is still `expected` and no
    /// newer writer has committed. Returns the new version.
    ///
    /// # Errors
    ///
    /// - `PipelineError::StaleWriter` if the stored record carries a newer
    ///   fencing token.
    /// - `PipelineError::MergeConflict` if the record changed since it was read.
    pub async fn commit<T: ProgressRecord>(
        &self,
        path: &str,
        record: &T,
        expected: Option<String>,
    ) -> Result<String> {
        let current = self.load::<T>(path).await?;
        if let Some((stored, version)) = &current {
            if stored.fencing_token() > record.fencing_token() {
                return Err(PipelineError::StaleWriter {
                    path: path.to_string(),
                    stored: stored.fencing_token(),
                    attempted: record.fencing_token(),
                });
            }
            if expected.as_deref() != Some(version.as_str()) {
                return Err(conflict(path));
            }
        } else if expected.is_some() {
            return Err(conflict(path));
        }

        let bytes = Bytes::from(serde_json::to_vec_pretty(record)?);
        match self
            .storage
            .put(path, bytes, WritePrecondition::from_observed(expected))
            .await?
        {
            WriteResult::Success { version } => Ok(version),
            WriteResult::PreconditionFailed { .. } => {
                crate::metrics::record_cas_retry("progress_commit");
                Err(conflict(path))
            }
        }
    }

    /// Loads a source cursor (default at offset zero if absent).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn load_cursor(&self, source_id: &str) -> Result<Versioned<Cursor>> {
        let mut loaded: Versioned<Cursor> = self.load_or_default(StateKey::cursor(source_id).path()).await?;
        if loaded.record.source_id.is_empty() {
            loaded.record.source_id = source_id.to_string();
        }
        Ok(loaded)
    }

    /// Commits a cursor.
    ///
    /// # Errors
    ///
    /// See [`ProgressStore::commit`].
    pub async fn commit_cursor(&self, cursor: &Cursor, expected: Option<String>) -> Result<String> {
        self.commit(StateKey::cursor(&cursor.source_id).path(), cursor, expected)
            .await
    }

    /// Loads an entity type's watermark (unset if absent).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn load_watermark(&self, entity_type: EntityType) -> Result<Versioned<Watermark>> {
        let mut loaded: Versioned<Watermark> = self
            .load_or_default(StateKey::watermark(entity_type.as_str()).path())
            .await?;
        loaded.record.entity_type = Some(entity_type);
        Ok(loaded)
    }

    /// Commits a watermark.
    ///
    /// # Errors
    ///
    /// See [`ProgressStore::commit`].
    pub async fn commit_watermark(
        &self,
        entity_type: EntityType,
        watermark: &Watermark,
        expected: Option<String>,
    ) -> Result<String> {
        self.commit(StateKey::watermark(entity_type.as_str()).path(), watermark, expected)
            .await
    }

    /// Loads a mart's progress record.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn load_mart_progress(&self, mart: &str) -> Result<Versioned<MartProgress>> {
        let mut loaded: Versioned<MartProgress> =
            self.load_or_default(StateKey::mart_progress(mart).path()).await?;
        if loaded.record.mart.is_empty() {
            loaded.record.mart = mart.to_string();
        }
        Ok(loaded)
    }

    /// Commits a mart's progress record.
    ///
    /// # Errors
    ///
    /// See [`ProgressStore::commit`].
    pub async fn commit_mart_progress(
        &self,
        progress: &MartProgress,
        expected: Option<String>,
    ) -> Result<String> {
        self.commit(StateKey::mart_progress(&progress.mart).path(), progress, expected)
            .await
    }

    /// Lists every stored cursor, sorted by source.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn list_cursors(&self) -> Result<Vec<Cursor>> {
        let mut metas = self.storage.list(StateKey::cursors_dir().path()).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        let mut cursors = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some((cursor, _)) = self.load::<Cursor>(&meta.path).await? {
                cursors.push(cursor);
            }
        }
        Ok(cursors)
    }
}

/// Checks that `token` is not older than the token stored in a record.
///
/// # Errors
///
/// Returns `PipelineError::StaleWriter` if the stored token is newer.
pub fn ensure_fresh(path: &str, stored: u64, token: FencingToken) -> Result<()> {
    if stored > token.sequence() {
        return Err(PipelineError::StaleWriter {
            path: path.to_string(),
            stored,
            attempted: token.sequence(),
        });
    }
    Ok(())
}

fn conflict(path: &str) -> PipelineError {
    PipelineError::MergeConflict {
        scope: path.to_string(),
        message: "record changed by a concurrent writer".into(),
    }
}
