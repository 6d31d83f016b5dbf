//! Quarantine sink for records that fail framing or validation.
//!
//! Quarantined records are never dropped: each is stored with its reason at
//! `quarantine/{stage}/{scope}/{record_hash}.json`. The hash covers stage,
//! scope, offset, payload and reason code, so quarantining the same record
//! again on a replay is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use strata_core::storage::{StorageBackend, WritePrecondition};
use strata_core::storage_keys::{QuarantineKey, StorageKey};

use crate::error::{PipelineError, Result};

/// Why a record was quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineReason {
    /// Stable reason code (`schema_violation`, `late_beyond_grace`, ...).
    pub code: String,
    /// Detailed code, e.g. the violation kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl QuarantineReason {
    /// Reason for a record older than the reprocessing window.
    #[must_use]
    pub fn late_beyond_grace(event_time: DateTime<Utc>, window_start: DateTime<Utc>) -> Self {
        Self {
            code: "late_beyond_grace".into(),
            detail: None,
            message: format!("event time {event_time} is before window start {window_start}"),
        }
    }
}

impl From<&PipelineError> for QuarantineReason {
    fn from(err: &PipelineError) -> Self {
        let detail = match err {
            PipelineError::SchemaViolation { kind, .. } => Some(kind.as_str().to_string()),
            _ => None,
        };
        Self {
            code: err.reason_code().to_string(),
            detail,
            message: err.to_string(),
        }
    }
}

/// A record routed to quarantine, with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Stage that rejected the record (`ingest`, `conform`).
    pub stage: String,
    /// Source or entity type within the stage.
    pub scope: String,
    /// Source offset, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// The record as received.
    pub record: Value,
}

/// Stored form of a quarantined record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    /// The rejected record and its origin.
    #[serde(flatten)]
    pub entry: QuarantineEntry,
    /// Why it was rejected.
    pub reason: QuarantineReason,
    /// When it was first quarantined.
    pub quarantined_at: DateTime<Utc>,
    /// Storage path of this record.
    #[serde(default)]
    pub path: String,
}

/// Append-only sink for rejected records.
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    /// Stores a rejected record. Returns its storage path.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be stored.
    async fn write(&self, entry: &QuarantineEntry, reason: &QuarantineReason) -> Result<String>;

    /// Lists quarantined records for a stage, optionally narrowed to a scope.
    ///
    /// # Errors
    ///
    /// Returns an error if records could not be read.
    async fn list(&self, stage: &str, scope: Option<&str>) -> Result<Vec<QuarantinedRecord>>;
}

/// Quarantine sink backed by the pipeline's object store.
#[derive(Debug)]
pub struct StorageQuarantineSink<S> {
    storage: Arc<S>,
}

impl<S> Clone for StorageQuarantineSink<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageBackend> StorageQuarantineSink<S> {
    /// Creates a sink over a backend.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

fn record_hash(entry: &QuarantineEntry, reason: &QuarantineReason) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.stage.as_bytes());
    hasher.update([0]);
    hasher.update(entry.scope.as_bytes());
    hasher.update([0]);
    if let Some(offset) = entry.offset {
        hasher.update(offset.to_be_bytes());
    }
    hasher.update([0]);
    hasher.update(entry.record.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(reason.code.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[async_trait]
impl<S: StorageBackend> QuarantineSink for StorageQuarantineSink<S> {
    async fn write(&self, entry: &QuarantineEntry, reason: &QuarantineReason) -> Result<String> {
        let key = QuarantineKey::record(&entry.stage, &entry.scope, &record_hash(entry, reason));
        let stored = QuarantinedRecord {
            entry: entry.clone(),
            reason: reason.clone(),
            quarantined_at: Utc::now(),
            path: key.path().to_string(),
        };
        let bytes = Bytes::from(serde_json::to_vec_pretty(&stored)?);
        // An existing record means this one was already quarantined.
        self.storage
            .put(key.path(), bytes, WritePrecondition::DoesNotExist)
            .await?;
        tracing::warn!(
            stage = %entry.stage,
            scope = %entry.scope,
            offset = ?entry.offset,
            reason = %reason.code,
            detail = ?reason.detail,
            path = %key,
            "record quarantined"
        );
        Ok(key.path().to_string())
    }

    async fn list(&self, stage: &str, scope: Option<&str>) -> Result<Vec<QuarantinedRecord>> {
        let mut metas = self.storage.list(QuarantineKey::dir(stage, scope).path()).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));

        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            let bytes = self.storage.get(&meta.path).await?;
            let mut record: QuarantinedRecord = serde_json::from_slice(&bytes)?;
            record.path = meta.path;
            records.push(record);
        }
        records.sort_by(|a, b| {
            (a.quarantined_at, &a.path).cmp(&(b.quarantined_at, &b.path))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;
    use serde_json::json;
    use strata_core::storage::MemoryBackend;

    fn entry() -> QuarantineEntry {
        QuarantineEntry {
            stage: "conform".into(),
            scope: "encounter".into(),
            offset: Some(4),
            record: json!({"encounter_id": "E1", "age": 150}),
        }
    }

    #[tokio::test]
    async fn write_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let sink = StorageQuarantineSink::new(backend.clone());
        let reason = QuarantineReason::from(&PipelineError::violation(
            ViolationKind::ImplausibleAge,
            "age 150 outside 0..=120",
        ));

        let first = sink.write(&entry(), &reason).await.unwrap();
        let second = sink.write(&entry(), &reason).await.unwrap();
        assert_eq!(first, second);

        let listed = sink.list("conform", None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason.code, "schema_violation");
        assert_eq!(listed[0].reason.detail.as_deref(), Some("implausible_age"));
        assert_eq!(listed[0].entry, entry());
        assert!(listed[0].path.starts_with("quarantine/conform/encounter/"));
    }

    #[tokio::test]
    async fn list_filters_by_scope() {
        let backend = Arc::new(MemoryBackend::new());
        let sink = StorageQuarantineSink::new(backend);
        let reason = QuarantineReason {
            code: "schema_violation".into(),
            detail: None,
            message: "bad".into(),
        };
        sink.write(&entry(), &reason).await.unwrap();
        let other = QuarantineEntry {
            scope: "patient".into(),
            ..entry()
        };
        sink.write(&other, &reason).await.unwrap();

        assert_eq!(sink.list("conform", Some("patient")).await.unwrap().len(), 1);
        assert_eq!(sink.list("conform", None).await.unwrap().len(), 2);
        assert!(sink.list("ingest", None).await.unwrap().is_empty());
    }
}
