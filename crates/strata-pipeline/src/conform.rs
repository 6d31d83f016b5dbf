//! Conformance transformer: raw records to deduplicated, typed entities.
//!
//! # Run protocol
//!
//! 1. Acquire the `conform/{entity}` lease; a busy lease is a merge conflict.
//! 2. Window: `since` (default: the stored watermark) minus the grace period.
//! 3. Read committed raw files of the entity's source that are new since the
//!    last run or whose ingestion hour may hold in-window records.
//! 4. Parse and validate each record; violations go to quarantine. New
//!    records older than the window are quarantined as `late_beyond_grace`.
//! 5. Apply records in `(event_time, ingested_at, offset)` order onto the
//!    committed entities. A record that orders before the stored entity is
//!    stale and ignored; otherwise its provided fields overwrite.
//! 6. Write snapshots of changed partitions, then CAS the manifest.
//! 7. Advance the watermark; it never regresses.
//!
//! Nothing is visible until step 6 succeeds, and the watermark only moves
//! after it, so a failed run is retried over the same window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_core::partition::PartitionKey;
use strata_core::storage::StorageBackend;
use strata_core::storage_keys::{ConformedKey, StateKey, StorageKey};
use strata_core::{LeaseGuard, RunId};

use crate::config::PipelineConfig;
use crate::conformed::{
    parse_partition, snapshot_hash, ConformedEntity, ConformedManifest, ConformedStore,
    PartitionedEntities,
};
use crate::entity::{parse_record, EntityType, ParsedRecord, RecordContext, ValidationRules};
use crate::error::{PipelineError, Result};
use crate::lease;
use crate::metrics;
use crate::progress::{ensure_fresh, ProgressStore, Versioned, Watermark};
use crate::quarantine::{QuarantineEntry, QuarantineReason, QuarantineSink, StorageQuarantineSink};
use crate::raw::{RawRecord, RawTier, RecordOrigin};

/// Outcome of one conformance run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConformResult {
    /// Entity type conformed.
    pub entity_type: EntityType,
    /// Entities inserted or changed.
    pub entities_upserted: u64,
    /// Watermark after the run.
    pub new_watermark: Option<DateTime<Utc>>,
    /// Partitions rewritten or removed.
    pub changed_partitions: Vec<PartitionKey>,
    /// Manifest version after the run.
    pub manifest_version: u64,
    /// In-window records read.
    pub records_read: u64,
    /// Records that failed validation.
    pub records_quarantined: u64,
    /// Records older than the reprocessing window.
    pub late_records: u64,
}

/// Effect of applying one record to the entity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New natural key.
    Inserted,
    /// Existing entity changed.
    Updated,
    /// Record re-applied with no effect.
    Unchanged,
    /// Record orders before the stored entity; ignored.
    Stale,
}

impl UpsertOutcome {
    /// Returns true if the entity's state changed.
    #[must_use]
    pub const fn is_change(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Upserts one validated record by natural key.
///
/// Ordering is `(event_time, ingested_at, source_offset)`: the later record
/// wins, and on equal event times the later ingestion wins. Only fields the
/// record provides are overwritten.
pub fn upsert(
    entities: &mut BTreeMap<String, ConformedEntity>,
    record: &ParsedRecord,
    source_offset: u64,
) -> UpsertOutcome {
    let incoming_key = (record.event_time, record.ingested_at, source_offset);
    match entities.get_mut(&record.natural_key) {
        None => {
            entities.insert(
                record.natural_key.clone(),
                ConformedEntity {
                    natural_key: record.natural_key.clone(),
                    attributes: record.record.clone(),
                    valid_from: record.event_time,
                    ingested_at: record.ingested_at,
                    source_offset,
                    source_watermark: None,
                },
            );
            UpsertOutcome::Inserted
        }
        Some(stored) if incoming_key < stored.order_key() => UpsertOutcome::Stale,
        Some(stored) => {
            let moved = incoming_key != stored.order_key();
            let changed = stored.attributes.overlay(&record.record);
            stored.valid_from = record.event_time;
            stored.ingested_at = record.ingested_at;
            stored.source_offset = source_offset;
            if changed || moved {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            }
        }
    }
}

/// Groups entities by their conformed partition.
#[must_use]
pub fn partition_entities(entities: BTreeMap<String, ConformedEntity>) -> PartitionedEntities {
    let mut out = PartitionedEntities::new();
    for entity in entities.into_values() {
        out.entry(entity.partition()).or_default().push(entity);
    }
    out
}

/// A validated record ready to apply, with its raw offset.
#[derive(Debug)]
struct Candidate {
    parsed: ParsedRecord,
    offset: u64,
}

#[derive(Debug, Default)]
struct ReadStats {
    records_read: u64,
    quarantined: u64,
    late: u64,
    max_event_time: Option<DateTime<Utc>>,
}

/// Merges raw records into the conformed tier.
#[derive(Debug)]
pub struct ConformanceTransformer<S> {
    storage: Arc<S>,
    config: PipelineConfig,
    raw: RawTier<S>,
    store: ConformedStore<S>,
    progress: ProgressStore<S>,
    quarantine: StorageQuarantineSink<S>,
}

impl<S: StorageBackend> ConformanceTransformer<S> {
    /// Creates a transformer.
    #[must_use]
    pub fn new(storage: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            raw: RawTier::new(Arc::clone(&storage)),
            store: ConformedStore::new(Arc::clone(&storage)),
            progress: ProgressStore::new(Arc::clone(&storage)),
            quarantine: StorageQuarantineSink::new(Arc::clone(&storage)),
            storage,
            config,
        }
    }

    /// Conforms new raw records of one entity type.
    ///
    /// `since` overrides the stored watermark as the window's upper anchor.
    ///
    /// # Errors
    ///
    /// - `MergeConflict` if another run holds the entity type or committed
    ///   first; retry serially.
    /// - `PartialWriteFailure` if a snapshot could not be written; nothing
    ///   was committed.
    #[tracing::instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn conform(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<ConformResult> {
        let run_id = RunId::generate();
        let started = std::time::Instant::now();
        let name = entity_type.as_str();

        let guard = lease::acquire(&self.storage, "conform", name, &self.config, run_id)
            .await
            .map_err(serialize_conflict)?;
        let result = self.conform_locked(&guard, entity_type, since).await;
        lease::release(guard, "conform", name).await;

        metrics::record_stage_outcome("conform", started, &result);
        result
    }

    /// Conforms every entity type as independent parallel units.
    pub async fn conform_all(&self) -> Vec<(EntityType, Result<ConformResult>)> {
        join_all(
            EntityType::ALL
                .iter()
                .map(|&entity_type| async move { (entity_type, self.conform(entity_type, None).await) }),
        )
        .await
    }

    async fn conform_locked(
        &self,
        guard: &LeaseGuard<S>,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<ConformResult> {
        let token = guard.fencing_token();
        let mut watermark = self.progress.load_watermark(entity_type).await?;
        ensure_fresh(
            StateKey::watermark(entity_type.as_str()).path(),
            watermark.record.fencing_token,
            token,
        )?;
        let source = self.config.source_for(entity_type).to_string();
        let committed_offset = self.progress.load_cursor(&source).await?.record.offset;

        let window_start = Watermark::window_start(
            since.or(watermark.record.max_observed_event_time),
            self.config.grace(),
        );
        let (candidates, stats) = self
            .read_candidates(entity_type, &source, committed_offset, watermark.record.source_offset, window_start)
            .await?;

        let manifest = self.store.manifest(entity_type).await?;
        ensure_fresh(
            ConformedKey::manifest(entity_type.as_str()).path(),
            manifest.record.fencing_token,
            token,
        )?;
        let mut entities: BTreeMap<String, ConformedEntity> = self
            .store
            .read_all(&manifest.record)
            .await?
            .into_values()
            .flatten()
            .map(|e| (e.natural_key.clone(), e))
            .collect();

        let mut changed_keys = BTreeSet::new();
        for Candidate { parsed, offset } in &candidates {
            if upsert(&mut entities, parsed, *offset).is_change() {
                changed_keys.insert(parsed.natural_key.clone());
            }
        }

        let mut next_watermark = watermark.record.clone();
        next_watermark.advance(stats.max_event_time);
        next_watermark.source_offset = next_watermark.source_offset.max(committed_offset);
        for key in &changed_keys {
            if let Some(entity) = entities.get_mut(key) {
                entity.source_watermark = next_watermark.max_observed_event_time;
            }
        }

        let (manifest_version, changed_partitions) = self
            .commit_partitions(guard, entity_type, manifest, partition_entities(entities))
            .await?;

        if next_watermark != watermark.record {
            next_watermark.fencing_token = token.sequence();
            next_watermark.updated_at = Some(Utc::now());
            self.progress
                .commit_watermark(entity_type, &next_watermark, watermark.version.take())
                .await?;
        }

        let upserted = changed_keys.len() as u64;
        metrics::record_upserts(entity_type.as_str(), upserted);
        if stats.quarantined + stats.late > 0 {
            metrics::record_quarantined("conform", entity_type.as_str(), stats.quarantined + stats.late);
        }
        tracing::info!(
            entity_type = %entity_type,
            upserted,
            read = stats.records_read,
            quarantined = stats.quarantined,
            late = stats.late,
            partitions = changed_partitions.len(),
            watermark = ?next_watermark.max_observed_event_time,
            "conformance committed"
        );

        Ok(ConformResult {
            entity_type,
            entities_upserted: upserted,
            new_watermark: next_watermark.max_observed_event_time,
            changed_partitions,
            manifest_version,
            records_read: stats.records_read,
            records_quarantined: stats.quarantined,
            late_records: stats.late,
        })
    }

    async fn read_candidates(
        &self,
        entity_type: EntityType,
        source: &str,
        committed_offset: u64,
        processed_offset: u64,
        window_start: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Candidate>, ReadStats)> {
        let rules = ValidationRules::from(&self.config);
        let skew = self.config.skew();
        let mut stats = ReadStats::default();
        let mut candidates = Vec::new();

        for file in self.raw.committed_files(source, committed_offset).await? {
            let is_new = file.last_offset >= processed_offset;
            let may_hold_window = match (window_start, file.hour_end()) {
                (Some(start), Some(end)) => end + skew > start,
                _ => true,
            };
            if !is_new && !may_hold_window {
                continue;
            }

            for raw in self.raw.read(&file.path).await? {
                let new = raw.offset >= processed_offset;
                let ctx = RecordContext {
                    ingested_at: raw.ingestion_timestamp,
                    event_time_field: match raw.origin {
                        RecordOrigin::Event => Some(self.config.event_time_field.as_str()),
                        RecordOrigin::Reference => None,
                    },
                    rules,
                };
                let parsed = match parse_record(entity_type, &raw.payload, &ctx) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        if new {
                            self.quarantine_record(entity_type, &raw, &QuarantineReason::from(&err))
                                .await?;
                            stats.quarantined += 1;
                        }
                        continue;
                    }
                };

                if let Some(start) = window_start {
                    if parsed.event_time < start {
                        if new {
                            let reason = QuarantineReason::late_beyond_grace(parsed.event_time, start);
                            self.quarantine_record(entity_type, &raw, &reason).await?;
                            stats.late += 1;
                        }
                        continue;
                    }
                }

                stats.records_read += 1;
                stats.max_event_time = stats.max_event_time.max(Some(parsed.event_time));
                candidates.push(Candidate {
                    parsed,
                    offset: raw.offset,
                });
            }
        }

        candidates.sort_by(|a, b| {
            (a.parsed.order_key(), a.offset).cmp(&(b.parsed.order_key(), b.offset))
        });
        Ok((candidates, stats))
    }

    async fn quarantine_record(
        &self,
        entity_type: EntityType,
        raw: &RawRecord,
        reason: &QuarantineReason,
    ) -> Result<()> {
        let entry = QuarantineEntry {
            stage: "conform".into(),
            scope: entity_type.as_str().into(),
            offset: Some(raw.offset),
            record: Value::Object(raw.payload.clone()),
        };
        self.quarantine.write(&entry, reason).await?;
        Ok(())
    }

    /// Writes changed snapshots and swaps the manifest.
    async fn commit_partitions(
        &self,
        guard: &LeaseGuard<S>,
        entity_type: EntityType,
        manifest: Versioned<ConformedManifest>,
        grouped: PartitionedEntities,
    ) -> Result<(u64, Vec<PartitionKey>)> {
        let current = manifest.record;
        let present: BTreeSet<String> = grouped.keys().map(ToString::to_string).collect();
        let mut changed: Vec<(PartitionKey, Vec<ConformedEntity>)> = Vec::new();
        for (partition, entities) in grouped {
            let hash = snapshot_hash(&entities)?;
            let unchanged = current
                .partitions
                .get(&partition.to_string())
                .is_some_and(|entry| entry.content_hash == hash);
            if !unchanged {
                changed.push((partition, entities));
            }
        }
        let removed: Vec<PartitionKey> = current
            .partitions
            .keys()
            .filter(|name| !present.contains(*name))
            .map(|name| parse_partition(name))
            .collect::<Result<_>>()?;

        if changed.is_empty() && removed.is_empty() {
            return Ok((current.version, Vec::new()));
        }

        let version = current.next_version();
        let mut next = current.clone();
        let affected: Vec<String> = changed
            .iter()
            .map(|(p, _)| p.to_string())
            .chain(removed.iter().map(ToString::to_string))
            .collect();
        for (partition, entities) in &changed {
            let entry = self
                .store
                .write_partition(entity_type, partition, version, entities.clone())
                .await
                .map_err(|e| PipelineError::PartialWriteFailure {
                    scope: format!("conform/{entity_type}"),
                    affected_partitions: affected.clone(),
                    message: e.to_string(),
                })?;
            next.partitions.insert(partition.to_string(), entry);
        }
        for partition in &removed {
            next.partitions.remove(&partition.to_string());
        }

        lease::ensure_held(guard, "conform", entity_type.as_str())
            .await
            .map_err(serialize_conflict)?;
        next.entity_type = Some(entity_type);
        next.version = version;
        next.fencing_token = guard.fencing_token().sequence();
        next.updated_at = Some(Utc::now());
        self.store.commit_manifest(&next, manifest.version).await?;

        let mut changed_partitions: Vec<PartitionKey> =
            changed.into_iter().map(|(p, _)| p).chain(removed).collect();
        changed_partitions.sort();
        Ok((version, changed_partitions))
    }
}

/// Conformance runs are serialized: lease contention is a merge conflict.
fn serialize_conflict(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::LeaseBusy { scope, message } => PipelineError::MergeConflict { scope, message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EncounterAttributes, EntityRecord};
    use crate::raw::RawIngestor;
    use crate::source::MemoryEventSource;
    use chrono::TimeZone;
    use serde_json::json;
    use strata_core::storage::MemoryBackend;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
    }

    fn encounter(key: &str, department: Option<&str>, event_time: DateTime<Utc>) -> ParsedRecord {
        ParsedRecord {
            natural_key: key.into(),
            record: EntityRecord::Encounter(EncounterAttributes {
                patient_id: Some("P1".into()),
                department: department.map(Into::into),
                ..EncounterAttributes::default()
            }),
            event_time,
            ingested_at: event_time,
        }
    }

    fn department(entity: &ConformedEntity) -> Option<&str> {
        entity.attributes.as_encounter().and_then(|e| e.department.as_deref())
    }

    #[test]
    fn later_record_wins_and_stale_is_ignored() {
        let mut entities = BTreeMap::new();
        let first = encounter("E1", Some("Cardiology"), ts(1, 0));
        let second = encounter("E1", Some("Cardiology-Revised"), ts(2, 0));

        assert_eq!(upsert(&mut entities, &first, 0), UpsertOutcome::Inserted);
        assert_eq!(upsert(&mut entities, &second, 1), UpsertOutcome::Updated);
        assert_eq!(upsert(&mut entities, &first, 0), UpsertOutcome::Stale);
        assert_eq!(upsert(&mut entities, &second, 1), UpsertOutcome::Unchanged);
        assert_eq!(department(&entities["E1"]), Some("Cardiology-Revised"));
    }

    #[test]
    fn partial_record_keeps_unspecified_fields() {
        let mut entities = BTreeMap::new();
        upsert(&mut entities, &encounter("E1", Some("Cardiology"), ts(1, 0)), 0);
        let mut partial = encounter("E1", None, ts(2, 0));
        if let EntityRecord::Encounter(e) = &mut partial.record {
            e.age = Some(40);
        }
        upsert(&mut entities, &partial, 1);

        let stored = entities["E1"].attributes.as_encounter().unwrap();
        assert_eq!(stored.department.as_deref(), Some("Cardiology"));
        assert_eq!(stored.age, Some(40));
    }

    #[test]
    fn equal_event_time_breaks_tie_on_ingestion() {
        let mut entities = BTreeMap::new();
        let mut early = encounter("E1", Some("A"), ts(1, 0));
        early.ingested_at = ts(1, 1);
        let mut late = encounter("E1", Some("B"), ts(1, 0));
        late.ingested_at = ts(1, 2);

        upsert(&mut entities, &late, 0);
        assert_eq!(upsert(&mut entities, &early, 5), UpsertOutcome::Stale);
        assert_eq!(department(&entities["E1"]), Some("B"));
    }

    async fn ingest(backend: &Arc<MemoryBackend>, source: &MemoryEventSource) {
        RawIngestor::new(Arc::clone(backend), PipelineConfig::default())
            .ingest(source)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn revised_department_replaces_original() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        let transformer = ConformanceTransformer::new(Arc::clone(&backend), PipelineConfig::default());

        source.push_json(json!({
            "encounter_id": "E1", "patient_id": "P1", "department": "Cardiology",
            "admission_time": "2025-01-10T08:00:00Z", "event_time": "2025-01-10T08:00:00Z"
        }));
        ingest(&backend, &source).await;
        let first = transformer.conform(EntityType::Encounter, None).await.unwrap();
        assert_eq!(first.entities_upserted, 1);
        assert_eq!(first.new_watermark, Some(Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap()));

        source.push_json(json!({
            "encounter_id": "E1", "patient_id": "P1", "department": "Cardiology-Revised",
            "admission_time": "2025-01-10T08:00:00Z", "event_time": "2025-01-10T09:00:00Z"
        }));
        ingest(&backend, &source).await;
        let second = transformer.conform(EntityType::Encounter, None).await.unwrap();
        assert_eq!(second.entities_upserted, 1);
        assert_eq!(second.changed_partitions, vec![PartitionKey::parse("month=2025-01").unwrap()]);

        let entities = ConformedStore::new(backend).entities_by_key(EntityType::Encounter).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(department(&entities["E1"]), Some("Cardiology-Revised"));
    }

    #[tokio::test]
    async fn same_key_in_one_batch_merges_in_event_order() {
        let full = json!({
            "encounter_id": "E1", "patient_id": "P1", "department": "Cardiology",
            "event_time": "2025-01-10T08:00:00Z"
        });
        let partial = json!({
            "encounter_id": "E1", "patient_id": "P1", "age": 40,
            "event_time": "2025-01-10T09:00:00Z"
        });

        // Newer partial record arrives first, both in one batch.
        let batched = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        source.push_json(partial.clone());
        source.push_json(full.clone());
        ingest(&batched, &source).await;
        ConformanceTransformer::new(Arc::clone(&batched), PipelineConfig::default())
            .conform(EntityType::Encounter, None)
            .await
            .unwrap();

        // Same records, in event order, across two runs.
        let split = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        let transformer = ConformanceTransformer::new(Arc::clone(&split), PipelineConfig::default());
        for record in [full, partial] {
            source.push_json(record);
            ingest(&split, &source).await;
            transformer.conform(EntityType::Encounter, None).await.unwrap();
        }

        let batched = ConformedStore::new(batched).entities_by_key(EntityType::Encounter).await.unwrap();
        let split = ConformedStore::new(split).entities_by_key(EntityType::Encounter).await.unwrap();
        let stored = batched["E1"].attributes.as_encounter().unwrap();
        assert_eq!(stored.department.as_deref(), Some("Cardiology"));
        assert_eq!(stored.age, Some(40));
        assert_eq!(batched["E1"].attributes, split["E1"].attributes);
        assert_eq!(batched["E1"].valid_from, split["E1"].valid_from);
    }

    #[tokio::test]
    async fn rerun_without_new_data_changes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        let transformer = ConformanceTransformer::new(Arc::clone(&backend), PipelineConfig::default());
        source.push_json(json!({"encounter_id": "E1", "patient_id": "P1", "event_time": "2025-01-10T08:00:00Z"}));
        ingest(&backend, &source).await;

        let first = transformer.conform(EntityType::Encounter, None).await.unwrap();
        let again = transformer.conform(EntityType::Encounter, None).await.unwrap();
        assert_eq!(again.entities_upserted, 0);
        assert!(again.changed_partitions.is_empty());
        assert_eq!(again.manifest_version, first.manifest_version);
        assert_eq!(again.new_watermark, first.new_watermark);
    }

    #[tokio::test]
    async fn invalid_and_late_records_are_quarantined() {
        let backend = Arc::new(MemoryBackend::new());
        let source = MemoryEventSource::new("encounters");
        let transformer = ConformanceTransformer::new(Arc::clone(&backend), PipelineConfig::default());

        source.push_json(json!({"encounter_id": "E1", "patient_id": "P1", "event_time": "2025-01-10T08:00:00Z"}));
        source.push_json(json!({"encounter_id": "E2", "patient_id": "P2", "age": 150}));
        ingest(&backend, &source).await;
        let first = transformer.conform(EntityType::Encounter, None).await.unwrap();
        assert_eq!(first.records_quarantined, 1);

        // Watermark is E1's event time; a record a day older is beyond grace.
        source.push_json(json!({"encounter_id": "E3", "patient_id": "P3", "event_time": "2025-01-09T08:00:00Z"}));
        ingest(&backend, &source).await;
        let second = transformer.conform(EntityType::Encounter, None).await.unwrap();
        assert_eq!(second.late_records, 1);
        assert_eq!(second.entities_upserted, 0);

        let sink = StorageQuarantineSink::new(Arc::clone(&backend));
        let codes: Vec<String> = sink
            .list("conform", Some("encounter"))
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.reason.code)
            .collect();
        assert_eq!(codes.len(), 2);
        assert!(codes.contains(&"late_beyond_grace".to_string()));
        assert!(codes.contains(&"schema_violation".to_string()));
    }
}
