//! Raw ingestor: lands source records verbatim in the append-only raw tier.
//!
//! # Batch protocol
//!
//! 1. Acquire the `ingest/{source}` lease.
//! 2. Pull up to `ingest_batch_size` records from the cursor offset.
//! 3. Record the batch as *pending* in the cursor (offset range and
//!    ingestion time) before writing anything.
//! 4. Frame each record; unframeable ones are quarantined, not dropped.
//! 5. Write the batch to
//!    `raw/{source}/date=YYYY-MM-DD/hour=HH/{first:020}-{last:020}.jsonl`.
//! 6. Advance the cursor past the batch and clear the pending marker (CAS).
//!
//! A crash anywhere before step 6 leaves the cursor where it was. The next
//! run discards the pending batch's file (it is beyond the cursor and so
//! invisible to readers) and lands the same offsets again under the same
//! ingestion hour. Readers only see files whose last offset is below the
//! committed cursor.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_core::partition::PartitionKey;
use strata_core::storage::{StorageBackend, WritePrecondition};
use strata_core::storage_keys::{RawKey, StateKey, StorageKey};
use strata_core::{LeaseGuard, RunId};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, ViolationKind};
use crate::lease;
use crate::metrics;
use crate::progress::{ensure_fresh, Cursor, PendingBatch, ProgressStore, Versioned};
use crate::quarantine::{QuarantineEntry, QuarantineReason, QuarantineSink, StorageQuarantineSink};
use crate::reference::{fingerprint, ReferenceLoader, ReferenceRow};
use crate::source::{EventSource, RecordPayload, SourceRecord};

const MAX_SOURCE_BACKOFF: Duration = Duration::from_secs(5);

/// Where a raw record came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Continuous event source.
    #[default]
    Event,
    /// Periodic reference load; its event time is the load time.
    Reference,
}

/// Immutable landing-tier envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Source identifier.
    pub source: String,
    /// Offset within the source.
    pub offset: u64,
    /// When the batch containing this record was ingested.
    pub ingestion_timestamp: DateTime<Utc>,
    /// Ingestion-hour partition.
    pub partition_key: PartitionKey,
    /// Event or reference record.
    #[serde(default)]
    pub origin: RecordOrigin,
    /// Framed payload.
    pub payload: Map<String, Value>,
}

/// Outcome of one ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    /// Source identifier.
    pub source_id: String,
    /// Records landed in the raw tier.
    pub records_written: u64,
    /// Records quarantined as unframeable.
    pub records_quarantined: u64,
    /// Committed cursor offset after the run.
    pub new_cursor: u64,
    /// Raw partitions written.
    pub partitions: Vec<PartitionKey>,
    /// True when a reference load matched the previous fingerprint.
    #[serde(default)]
    pub unchanged: bool,
}

/// A committed raw batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    /// Storage path.
    pub path: String,
    /// Ingestion-hour partition.
    pub partition: PartitionKey,
    /// First offset in the file.
    pub first_offset: u64,
    /// Last offset in the file.
    pub last_offset: u64,
}

impl RawFile {
    /// End of the ingestion hour the file belongs to.
    #[must_use]
    pub fn hour_end(&self) -> Option<DateTime<Utc>> {
        self.partition
            .hour_start()
            .map(|start| start + chrono::Duration::hours(1))
    }
}

/// Read access to committed raw batches.
#[derive(Debug)]
pub struct RawTier<S> {
    storage: Arc<S>,
}

impl<S> Clone for RawTier<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageBackend> RawTier<S> {
    /// Creates a reader over a backend.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Lists files of `source` fully below `committed_offset`, in offset order.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn committed_files(&self, source: &str, committed_offset: u64) -> Result<Vec<RawFile>> {
        let metas = self.storage.list(RawKey::source_dir(source).path()).await?;
        let mut files: Vec<RawFile> = metas
            .into_iter()
            .filter_map(|meta| {
                let (partition, first_offset, last_offset) = RawKey::parse_batch(source, &meta.path)?;
                (last_offset < committed_offset).then_some(RawFile {
                    path: meta.path,
                    partition,
                    first_offset,
                    last_offset,
                })
            })
            .collect();
        files.sort_by_key(|f| (f.first_offset, f.last_offset));
        Ok(files)
    }

    /// Reads every record of a batch file.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt line.
    pub async fn read(&self, path: &str) -> Result<Vec<RawRecord>> {
        let bytes = self.storage.get(path).await?;
        decode_batch(path, &bytes)
    }
}

fn encode_batch(records: &[RawRecord]) -> Result<Bytes> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

fn decode_batch(path: &str, bytes: &[u8]) -> Result<Vec<RawRecord>> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_slice(line).map_err(|e| PipelineError::Serialization {
                message: format!("corrupt raw record in {path}: {e}"),
            })
        })
        .collect()
}

/// Frames a source payload as a JSON object.
fn frame(payload: &RecordPayload) -> Result<Map<String, Value>> {
    match payload {
        RecordPayload::Structured(map) => Ok(map.clone()),
        RecordPayload::Bytes(bytes) => match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(PipelineError::violation(
                ViolationKind::Unframeable,
                format!("payload is a JSON {}, not an object", json_kind(&other)),
            )),
            Err(e) => Err(PipelineError::violation(
                ViolationKind::Unframeable,
                format!("payload is not JSON: {e}"),
            )),
        },
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn payload_for_quarantine(payload: &RecordPayload) -> Value {
    match payload {
        RecordPayload::Structured(map) => Value::Object(map.clone()),
        RecordPayload::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Lands source records in the raw tier and owns source cursors.
#[derive(Debug)]
pub struct RawIngestor<S> {
    storage: Arc<S>,
    config: PipelineConfig,
    progress: ProgressStore<S>,
    quarantine: StorageQuarantineSink<S>,
}

impl<S: StorageBackend> RawIngestor<S> {
    /// Creates an ingestor.
    #[must_use]
    pub fn new(storage: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            progress: ProgressStore::new(Arc::clone(&storage)),
            quarantine: StorageQuarantineSink::new(Arc::clone(&storage)),
            storage,
            config,
        }
    }

    /// Ingests the next batch from an event source.
    ///
    /// # Errors
    ///
    /// - `SourceUnavailable` once source retries are exhausted.
    /// - `PartialWriteFailure` if the batch could not be written; the
    ///   cursor is not advanced.
    /// - `LeaseBusy` if another run is ingesting the same source.
    #[tracing::instrument(skip_all, fields(source = %source.source_id()))]
    pub async fn ingest(&self, source: &dyn EventSource) -> Result<IngestResult> {
        let source_id = source.source_id().to_string();
        strata_core::storage_keys::validate_name(&source_id)?;
        let run_id = RunId::generate();
        let started = std::time::Instant::now();

        let guard = lease::acquire(&self.storage, "ingest", &source_id, &self.config, run_id).await?;
        let result = self.ingest_events(&guard, source, &source_id).await;
        lease::release(guard, "ingest", &source_id).await;

        metrics::record_stage_outcome("ingest", started, &result);
        result
    }

    async fn ingest_events(
        &self,
        guard: &LeaseGuard<S>,
        source: &dyn EventSource,
        source_id: &str,
    ) -> Result<IngestResult> {
        let mut state = self.load_cursor(guard, source_id).await?;
        let ingested_at = self.discard_pending(source_id, &mut state.record).await?;

        let from = state.record.offset;
        let batch = self
            .pull_with_retry(source_id, || source.pull(from, self.config.ingest_batch_size))
            .await?;
        if batch.next_offset <= from {
            if ingested_at.is_some() {
                // The unfinished batch is gone from the source; drop the marker.
                self.commit_cursor(guard, &mut state).await?;
            }
            return Ok(self.idle_result(source_id, from));
        }

        let ingested_at = ingested_at.unwrap_or_else(Utc::now);
        let pending = PendingBatch {
            from_offset: from,
            to_offset: batch.next_offset,
            ingested_at,
        };
        state.record.pending = Some(pending.clone());
        self.commit_cursor(guard, &mut state).await?;

        let partition = PartitionKey::hourly(ingested_at);
        let mut records = Vec::with_capacity(batch.records.len());
        let mut quarantined = 0_u64;
        for SourceRecord { offset, payload } in &batch.records {
            match frame(payload) {
                Ok(map) => records.push(RawRecord {
                    source: source_id.to_string(),
                    offset: *offset,
                    ingestion_timestamp: ingested_at,
                    partition_key: partition.clone(),
                    origin: RecordOrigin::Event,
                    payload: map,
                }),
                Err(err) => {
                    self.quarantine
                        .write(
                            &QuarantineEntry {
                                stage: "ingest".into(),
                                scope: source_id.to_string(),
                                offset: Some(*offset),
                                record: payload_for_quarantine(payload),
                            },
                            &QuarantineReason::from(&err),
                        )
                        .await?;
                    quarantined += 1;
                }
            }
        }

        self.land(guard, &mut state, &pending, &records, None).await?;
        metrics::record_ingest(source_id, records.len() as u64, quarantined);

        Ok(IngestResult {
            source_id: source_id.to_string(),
            records_written: records.len() as u64,
            records_quarantined: quarantined,
            new_cursor: state.record.offset,
            partitions: if records.is_empty() { Vec::new() } else { vec![partition] },
            unchanged: false,
        })
    }

    /// Lands a full reference load when its content changed.
    ///
    /// Rows take consecutive offsets after the cursor; the load's SHA-256
    /// fingerprint is stored in the cursor so an identical load lands nothing.
    ///
    /// # Errors
    ///
    /// Same as [`RawIngestor::ingest`].
    #[tracing::instrument(skip(self, loader))]
    pub async fn ingest_reference(
        &self,
        loader: &dyn ReferenceLoader,
        source_name: &str,
    ) -> Result<IngestResult> {
        strata_core::storage_keys::validate_name(source_name)?;
        let run_id = RunId::generate();
        let started = std::time::Instant::now();

        let guard = lease::acquire(&self.storage, "ingest", source_name, &self.config, run_id).await?;
        let result = self.ingest_reference_rows(&guard, loader, source_name).await;
        lease::release(guard, "ingest", source_name).await;

        metrics::record_stage_outcome("ingest", started, &result);
        result
    }

    async fn ingest_reference_rows(
        &self,
        guard: &LeaseGuard<S>,
        loader: &dyn ReferenceLoader,
        source_name: &str,
    ) -> Result<IngestResult> {
        let mut state = self.load_cursor(guard, source_name).await?;
        let rows: Vec<ReferenceRow> = self
            .pull_with_retry(source_name, || loader.load(source_name))
            .await?;
        let fp = fingerprint(&rows);

        if state.record.pending.is_none() && state.record.fingerprint.as_deref() == Some(fp.as_str()) {
            tracing::debug!(source = source_name, "reference load unchanged");
            return Ok(IngestResult {
                unchanged: true,
                ..self.idle_result(source_name, state.record.offset)
            });
        }

        let ingested_at = self
            .discard_pending(source_name, &mut state.record)
            .await?
            .unwrap_or_else(Utc::now);
        let from = state.record.offset;
        if rows.is_empty() {
            state.record.fingerprint = Some(fp);
            self.commit_cursor(guard, &mut state).await?;
            return Ok(self.idle_result(source_name, from));
        }

        let pending = PendingBatch {
            from_offset: from,
            to_offset: from + rows.len() as u64,
            ingested_at,
        };
        state.record.pending = Some(pending.clone());
        self.commit_cursor(guard, &mut state).await?;

        let partition = PartitionKey::hourly(ingested_at);
        let records: Vec<RawRecord> = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| RawRecord {
                source: source_name.to_string(),
                offset: from + i as u64,
                ingestion_timestamp: ingested_at,
                partition_key: partition.clone(),
                origin: RecordOrigin::Reference,
                payload: row.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
            })
            .collect();

        self.land(guard, &mut state, &pending, &records, Some(fp)).await?;
        metrics::record_ingest(source_name, records.len() as u64, 0);

        Ok(IngestResult {
            source_id: source_name.to_string(),
            records_written: records.len() as u64,
            records_quarantined: 0,
            new_cursor: state.record.offset,
            partitions: vec![partition],
            unchanged: false,
        })
    }

    fn idle_result(&self, source_id: &str, offset: u64) -> IngestResult {
        IngestResult {
            source_id: source_id.to_string(),
            new_cursor: offset,
            ..IngestResult::default()
        }
    }

    async fn load_cursor(&self, guard: &LeaseGuard<S>, source_id: &str) -> Result<Versioned<Cursor>> {
        let state = self.progress.load_cursor(source_id).await?;
        ensure_fresh(
            StateKey::cursor(source_id).path(),
            state.record.fencing_token,
            guard.fencing_token(),
        )?;
        Ok(state)
    }

    /// Drops the file of an unfinished batch and returns its ingestion time.
    async fn discard_pending(&self, source_id: &str, cursor: &mut Cursor) -> Result<Option<DateTime<Utc>>> {
        let Some(pending) = cursor.pending.take() else {
            return Ok(None);
        };
        tracing::info!(
            source = source_id,
            from = pending.from_offset,
            to = pending.to_offset,
            "retrying unfinished batch"
        );
        if pending.to_offset > pending.from_offset {
            let stale = RawKey::batch(
                source_id,
                &PartitionKey::hourly(pending.ingested_at),
                pending.from_offset,
                pending.to_offset - 1,
            );
            self.storage.delete(stale.path()).await?;
        }
        Ok(Some(pending.ingested_at))
    }

    async fn land(
        &self,
        guard: &LeaseGuard<S>,
        state: &mut Versioned<Cursor>,
        pending: &PendingBatch,
        records: &[RawRecord],
        fingerprint: Option<String>,
    ) -> Result<()> {
        let source_id = state.record.source_id.clone();
        let partition = PartitionKey::hourly(pending.ingested_at);
        if !records.is_empty() {
            let key = RawKey::batch(&source_id, &partition, pending.from_offset, pending.to_offset - 1);
            let bytes = encode_batch(records)?;
            self.storage
                .put(key.path(), bytes, WritePrecondition::None)
                .await
                .map_err(|e| PipelineError::PartialWriteFailure {
                    scope: source_id.clone(),
                    affected_partitions: vec![partition.to_string()],
                    message: format!("write {key}: {e}"),
                })?;
        }

        lease::ensure_held(guard, "ingest", &source_id).await?;
        state.record.offset = pending.to_offset;
        state.record.pending = None;
        if fingerprint.is_some() {
            state.record.fingerprint = fingerprint;
        }
        self.commit_cursor(guard, state).await?;
        tracing::info!(
            source = %source_id,
            records = records.len(),
            cursor = state.record.offset,
            partition = %partition,
            "raw batch committed"
        );
        Ok(())
    }

    async fn commit_cursor(&self, guard: &LeaseGuard<S>, state: &mut Versioned<Cursor>) -> Result<()> {
        state.record.fencing_token = guard.fencing_token().sequence();
        state.record.updated_at = Some(Utc::now());
        let version = self
            .progress
            .commit_cursor(&state.record, state.version.take())
            .await?;
        state.version = Some(version);
        Ok(())
    }

    async fn pull_with_retry<T, F, Fut>(&self, source_id: &str, mut pull: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.config.source_retry_attempts.max(1);
        let mut delay = self.config.source_backoff_base;
        let mut attempt = 1;
        loop {
            match pull().await {
                Err(err @ PipelineError::SourceUnavailable { .. }) if attempt < attempts => {
                    tracing::warn!(
                        source = source_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "source unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_SOURCE_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::MemoryReferenceLoader;
    use crate::source::MemoryEventSource;
    use serde_json::json;
    use strata_core::storage::MemoryBackend;

    fn ingestor(backend: &Arc<MemoryBackend>) -> RawIngestor<MemoryBackend> {
        let config = PipelineConfig {
            ingest_batch_size: 2,
            source_backoff_base: Duration::from_millis(1),
            ..PipelineConfig::default()
        };
        RawIngestor::new(Arc::clone(backend), config)
    }

    #[tokio::test]
    async fn batches_advance_cursor() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        for i in 0..3 {
            source.push_json(json!({"encounter_id": format!("E{i}"), "patient_id": "P1"}));
        }
        let ingestor = ingestor(&backend);

        let first = ingestor.ingest(&source).await.unwrap();
        assert_eq!(first.records_written, 2);
        assert_eq!(first.new_cursor, 2);

        let second = ingestor.ingest(&source).await.unwrap();
        assert_eq!(second.records_written, 1);
        assert_eq!(second.new_cursor, 3);

        let idle = ingestor.ingest(&source).await.unwrap();
        assert_eq!(idle.records_written, 0);
        assert_eq!(idle.new_cursor, 3);

        let tier = RawTier::new(Arc::clone(&backend));
        let files = tier.committed_files("encounters", 3).await.unwrap();
        assert_eq!(files.len(), 2);
        let records = tier.read(&files[0].path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].offset, 1);
    }

    #[tokio::test]
    async fn unframeable_records_are_quarantined_and_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        source.push_bytes("not json");
        source.push_json(json!([1, 2]));
        let ingestor = ingestor(&backend);

        let result = ingestor.ingest(&source).await.unwrap();
        assert_eq!(result.records_written, 0);
        assert_eq!(result.records_quarantined, 2);
        assert_eq!(result.new_cursor, 2);

        let sink = StorageQuarantineSink::new(Arc::clone(&backend));
        let quarantined = sink.list("ingest", Some("encounters")).await.unwrap();
        assert_eq!(quarantined.len(), 2);
        assert!(quarantined
            .iter()
            .all(|q| q.reason.detail.as_deref() == Some("unframeable")));
    }

    #[tokio::test]
    async fn transient_outage_is_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        source.push_json(json!({"encounter_id": "E1", "patient_id": "P1"}));
        source.fail_next(2);

        let result = ingestor(&backend).ingest(&source).await.unwrap();
        assert_eq!(result.records_written, 1);
    }

    #[tokio::test]
    async fn persistent_outage_surfaces_and_keeps_cursor() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        source.push_json(json!({"encounter_id": "E1", "patient_id": "P1"}));
        source.fail_next(10);

        let err = ingestor(&backend).ingest(&source).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        let cursor = ProgressStore::new(backend).load_cursor("encounters").await.unwrap();
        assert_eq!(cursor.record.offset, 0);
    }

    #[tokio::test]
    async fn unchanged_reference_load_lands_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let loader = MemoryReferenceLoader::new();
        let rows: Vec<ReferenceRow> = vec![
            [("Id", "Y1"), ("NAME", "Aetna")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ];
        loader.set("payers", rows);
        let ingestor = ingestor(&backend);

        let first = ingestor.ingest_reference(&loader, "payers").await.unwrap();
        assert_eq!(first.records_written, 1);
        assert_eq!(first.new_cursor, 1);

        let second = ingestor.ingest_reference(&loader, "payers").await.unwrap();
        assert!(second.unchanged);
        assert_eq!(second.records_written, 0);
        assert_eq!(second.new_cursor, 1);

        let files = RawTier::new(backend).committed_files("payers", 1).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn frame_accepts_objects_only() {
        assert!(frame(&RecordPayload::Bytes(Bytes::from_static(b"{\"a\":1}"))).is_ok());
        assert!(frame(&RecordPayload::Bytes(Bytes::from_static(b"\"a\""))).is_err());
        assert!(frame(&RecordPayload::Bytes(Bytes::from_static(b"{"))).is_err());
    }
}
