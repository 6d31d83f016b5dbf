//! Integration tests for crash-safety under injected write failures.
//!
//! A stage that fails partway must leave its manifest and progress markers
//! where they were, and a retry must converge to the output of a clean run.

use std::sync::Arc;

use strata_core::storage::{MemoryBackend, StorageBackend, WritePrecondition};
use strata_pipeline::conformed::ConformedStore;
use strata_pipeline::progress::ProgressStore;
use strata_pipeline::{
    AggregationEngine, ConformanceTransformer, EntityType, Mart, MemoryEventSource, PipelineConfig,
    PipelineError, RawIngestor,
};
use strata_test_utils::{
    assert_snapshots_identical, assert_wrote_under, encounter_history, snapshot_prefix,
    FailingBackend, TracingMemoryBackend,
};

async fn land_history<S: StorageBackend>(storage: &Arc<S>) {
    let source = MemoryEventSource::new("encounters");
    for event in encounter_history() {
        source.push_json(event);
    }
    RawIngestor::new(Arc::clone(storage), PipelineConfig::default())
        .ingest(&source)
        .await
        .unwrap();
}

/// Half of the partition writes fail: nothing is committed, and the retry
/// produces the same mart as a run that never failed.
#[tokio::test]
async fn test_partial_mart_write_leaves_manifest_untouched() {
    let storage = Arc::new(FailingBackend::new(Arc::new(MemoryBackend::new())));
    let config = PipelineConfig::default();
    land_history(&storage).await;
    ConformanceTransformer::new(Arc::clone(&storage), config.clone())
        .conform(EntityType::Encounter, None)
        .await
        .unwrap();

    let engine = AggregationEngine::new(Arc::clone(&storage), config.clone());
    let affected = engine.affected_partitions(Mart::Department).await.unwrap();
    assert_eq!(affected.len(), 2, "history spans two months");

    storage.fail_after_writes(1, "gold/department/");
    let err = engine.aggregate(Mart::Department, &affected).await.unwrap_err();
    match &err {
        PipelineError::PartialWriteFailure {
            affected_partitions,
            ..
        } => assert_eq!(affected_partitions.len(), 2),
        other => panic!("expected partial write failure, got {other:?}"),
    }
    assert_eq!(err.reason_code(), "partial_write_failure");

    let manifest = engine.manifest(Mart::Department).await.unwrap();
    assert!(manifest.version.is_none(), "manifest must not be committed");
    let progress = ProgressStore::new(Arc::clone(&storage))
        .load_mart_progress("department")
        .await
        .unwrap();
    assert!(progress.version.is_none(), "progress must not advance");
    assert_eq!(
        engine.affected_partitions(Mart::Department).await.unwrap(),
        affected
    );

    storage.heal();
    let retried = engine.aggregate(Mart::Department, &affected).await.unwrap();
    assert_eq!(retried.partitions_written.len(), 2);

    // A clean run over the same inputs.
    let clean = Arc::new(MemoryBackend::new());
    land_history(&clean).await;
    ConformanceTransformer::new(Arc::clone(&clean), config.clone())
        .conform(EntityType::Encounter, None)
        .await
        .unwrap();
    let clean_engine = AggregationEngine::new(Arc::clone(&clean), config);
    let clean_affected = clean_engine.affected_partitions(Mart::Department).await.unwrap();
    clean_engine.aggregate(Mart::Department, &clean_affected).await.unwrap();

    let failed_then_retried = snapshot_prefix(storage.inner().as_ref(), "gold/department/month=").await;
    let never_failed = snapshot_prefix(clean.as_ref(), "gold/department/month=").await;
    assert_eq!(
        failed_then_retried.values().collect::<Vec<_>>(),
        never_failed.values().collect::<Vec<_>>()
    );
}

/// One snapshot lands before the next write fails: the manifest and
/// watermark stay put, and the retry matches a run that never failed.
#[tokio::test]
async fn test_failed_snapshot_write_keeps_watermark() {
    let storage = Arc::new(FailingBackend::new(Arc::new(MemoryBackend::new())));
    let config = PipelineConfig::default();
    land_history(&storage).await;

    // Same landed raw tier, conformed without failures.
    let clean = Arc::new(MemoryBackend::new());
    for (path, data) in snapshot_prefix(storage.inner().as_ref(), "").await {
        clean.put(&path, data, WritePrecondition::None).await.unwrap();
    }

    let transformer = ConformanceTransformer::new(Arc::clone(&storage), config.clone());
    storage.fail_after_writes(1, "conformed/encounter/month=");
    let err = transformer.conform(EntityType::Encounter, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::PartialWriteFailure { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(storage.failed_paths().len(), 1);
    let leftover = snapshot_prefix(storage.inner().as_ref(), "conformed/encounter/month=").await;
    assert_eq!(leftover.len(), 1, "one snapshot written before the failure");

    let progress = ProgressStore::new(Arc::clone(&storage));
    let watermark = progress.load_watermark(EntityType::Encounter).await.unwrap();
    assert!(watermark.version.is_none());
    assert!(watermark.record.max_observed_event_time.is_none());
    let manifest = ConformedStore::new(Arc::clone(&storage))
        .manifest(EntityType::Encounter)
        .await
        .unwrap();
    assert!(manifest.version.is_none());

    storage.heal();
    let result = transformer.conform(EntityType::Encounter, None).await.unwrap();
    assert_eq!(result.entities_upserted, 10);
    assert!(result.new_watermark.is_some());

    ConformanceTransformer::new(Arc::clone(&clean), config)
        .conform(EntityType::Encounter, None)
        .await
        .unwrap();
    assert_snapshots_identical(
        &snapshot_prefix(clean.as_ref(), "conformed/encounter/month=").await,
        &snapshot_prefix(storage.inner().as_ref(), "conformed/encounter/month=").await,
    );
}

/// A failed raw write leaves the cursor at its old offset with the batch
/// intent recorded; the retry lands the whole batch.
#[tokio::test]
async fn test_failed_raw_write_keeps_cursor() {
    let storage = Arc::new(TracingMemoryBackend::new());
    let source = MemoryEventSource::new("encounters");
    for event in encounter_history() {
        source.push_json(event);
    }
    let ingestor = RawIngestor::new(Arc::clone(&storage), PipelineConfig::default());

    storage.inject_failure("raw/encounters/");
    let err = ingestor.ingest(&source).await.unwrap_err();
    assert!(matches!(err, PipelineError::PartialWriteFailure { .. }), "{err:?}");
    assert!(err.is_retryable());

    let progress = ProgressStore::new(Arc::clone(&storage));
    let cursor = progress.load_cursor("encounters").await.unwrap().record;
    assert_eq!(cursor.offset, 0);
    let pending = cursor.pending.expect("batch intent recorded before writing");
    assert_eq!((pending.from_offset, pending.to_offset), (0, 10));

    storage.clear_failures();
    storage.clear_operations();
    let result = ingestor.ingest(&source).await.unwrap();
    assert_eq!(result.records_written, 10);
    assert_eq!(result.new_cursor, 10);
    assert_wrote_under(&storage.operations(), "raw/encounters/");

    let cursor = progress.load_cursor("encounters").await.unwrap().record;
    assert_eq!(cursor.offset, 10);
    assert!(cursor.pending.is_none());
}
