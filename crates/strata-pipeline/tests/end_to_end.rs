//! End-to-end pipeline scenarios: late data, quarantine, partition moves,
//! and a restart over the local filesystem backend.

use std::sync::Arc;

use bytes::Bytes;
use strata_core::storage::{MemoryBackend, StorageBackend};
use strata_core::LocalFsBackend;
use strata_pipeline::parquet_util;
use strata_pipeline::progress::ProgressStore;
use strata_pipeline::quarantine::{QuarantineSink, StorageQuarantineSink};
use strata_pipeline::{
    EventSource, JsonLinesSource, Mart, MemoryEventSource, MemoryReferenceLoader, Pipeline,
    PipelineConfig, RawIngestor, StageStatus,
};
use strata_test_utils::{
    encounter_history, organization_row, patient_row, payer_row, ts, EncounterBuilder,
};

fn pipeline<S: StorageBackend>(storage: Arc<S>) -> (Pipeline<S>, Arc<MemoryEventSource>) {
    let source = Arc::new(MemoryEventSource::new("encounters"));
    let loader = Arc::new(MemoryReferenceLoader::new());
    loader.set("payers", vec![payer_row("Y1", "Aetna"), payer_row("Y2", "Medicare")]);
    loader.set(
        "organizations",
        vec![
            organization_row("O1", "General Hospital", "Boston", "MA"),
            organization_row("O2", "Harbor Clinic", "Salem", "MA"),
        ],
    );
    loader.set(
        "patients",
        vec![patient_row("P1", "1980-04-02", "F"), patient_row("P2", "3/14/1955", "M")],
    );
    let pipeline = Pipeline::new(storage, PipelineConfig::default())
        .with_source(Arc::clone(&source) as Arc<dyn EventSource>)
        .with_reference_loader(loader, ["payers", "organizations", "patients"]);
    (pipeline, source)
}

/// Records older than the grace window are quarantined, not merged.
#[tokio::test]
async fn test_late_records_are_quarantined() {
    let storage = Arc::new(MemoryBackend::new());
    let (pipeline, source) = pipeline(Arc::clone(&storage));

    source.push_json(
        EncounterBuilder::new("E1", "P1")
            .event_time(ts("2025-01-10T12:00:00Z"))
            .build(),
    );
    assert!(pipeline.run_once().await.is_success());

    // Grace is two hours: 11:00 is inside the window, 08:00 is not.
    source.push_json(
        EncounterBuilder::new("E2", "P2")
            .event_time(ts("2025-01-10T11:00:00Z"))
            .build(),
    );
    source.push_json(
        EncounterBuilder::new("E3", "P3")
            .event_time(ts("2025-01-10T08:00:00Z"))
            .build(),
    );
    let report = pipeline.run_once().await;
    assert!(report.is_success(), "{report:?}");
    let conform = report
        .stages
        .iter()
        .find(|s| s.stage == "conform" && s.scope == "encounter")
        .unwrap();
    let summary = conform.summary.as_ref().unwrap();
    assert_eq!(summary["late_records"], 1);
    assert_eq!(summary["entities_upserted"], 1);

    let quarantined = StorageQuarantineSink::new(Arc::clone(&storage))
        .list("conform", Some("encounter"))
        .await
        .unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason.code, "late_beyond_grace");
    assert_eq!(quarantined[0].entry.record["encounter_id"], "E3");

    let manifest = pipeline.engine().manifest(Mart::Department).await.unwrap().record;
    let rows = pipeline
        .engine()
        .read_partition(Mart::Department, &manifest.partitions["month=2025-01"])
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.encounter_count).sum::<i64>(), 2);
}

/// Malformed and invalid records are quarantined while valid ones flow through.
#[tokio::test]
async fn test_invalid_records_do_not_block_batch() {
    let storage = Arc::new(MemoryBackend::new());
    let (pipeline, source) = pipeline(Arc::clone(&storage));

    source.push_bytes(Bytes::from_static(b"{not json"));
    source.push_json(EncounterBuilder::new("E1", "P1").field("age", serde_json::json!(150)).build());
    source.push_json(EncounterBuilder::new("E2", "P2").without("patient_id").build());
    source.push_json(EncounterBuilder::new("E3", "P3").build());

    let report = pipeline.run_once().await;
    assert!(report.is_success(), "{report:?}");

    let sink = StorageQuarantineSink::new(Arc::clone(&storage));
    assert_eq!(sink.list("ingest", Some("encounters")).await.unwrap().len(), 1);
    let rejected = sink.list("conform", Some("encounter")).await.unwrap();
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(|r| r.reason.code == "schema_violation"));

    let views = pipeline.views().read_view("conformed.encounter").await.unwrap();
    assert_eq!(views.iter().map(|b| b.num_rows()).sum::<usize>(), 1);

    // Quarantine is written once per record, not once per run.
    assert!(pipeline.run_once().await.is_success());
    assert_eq!(sink.list("conform", Some("encounter")).await.unwrap().len(), 2);
}

/// Moving an encounter to another month removes the emptied partition everywhere.
#[tokio::test]
async fn test_emptied_partition_is_unpublished() {
    let storage = Arc::new(MemoryBackend::new());
    let (pipeline, source) = pipeline(Arc::clone(&storage));

    source.push_json(
        EncounterBuilder::new("E1", "P1")
            .admitted(ts("2025-01-31T22:00:00Z"))
            .discharged(ts("2025-01-31T23:00:00Z"))
            .event_time(ts("2025-02-01T00:00:00Z"))
            .build(),
    );
    assert!(pipeline.run_once().await.is_success());
    let january = "export/payer/month=2025-01/data.parquet";
    assert!(storage.head(january).await.unwrap().is_some());

    // Corrected admission time lands in February.
    source.push_json(
        EncounterBuilder::new("E1", "P1")
            .admitted(ts("2025-02-01T01:00:00Z"))
            .discharged(ts("2025-02-01T02:00:00Z"))
            .event_time(ts("2025-02-01T01:00:00Z"))
            .build(),
    );
    let report = pipeline.run_once().await;
    assert!(report.is_success(), "{report:?}");

    assert!(storage.head(january).await.unwrap().is_none());
    assert!(storage
        .head("export/payer/month=2025-02/data.parquet")
        .await
        .unwrap()
        .is_some());
    let manifest = pipeline.engine().manifest(Mart::Payer).await.unwrap().record;
    assert_eq!(manifest.partitions.keys().collect::<Vec<_>>(), vec!["month=2025-02"]);
    let published = pipeline.publisher().published(Mart::Payer).await.unwrap().record;
    assert_eq!(published.partitions.keys().collect::<Vec<_>>(), vec!["month=2025-02"]);
}

/// A source outage fails only its own ingest unit; downstream stages still run.
#[tokio::test]
async fn test_source_outage_isolated_to_ingest() {
    let storage = Arc::new(MemoryBackend::new());
    let source = Arc::new(MemoryEventSource::new("encounters"));
    source.push_json(EncounterBuilder::new("E1", "P1").build());
    source.fail_next(u32::MAX);
    let pipeline = Pipeline::new(
        Arc::clone(&storage),
        PipelineConfig {
            source_backoff_base: std::time::Duration::from_millis(1),
            ..PipelineConfig::default()
        },
    )
    .with_source(source as Arc<dyn EventSource>);

    let report = pipeline.run_once().await;
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, "ingest");
    assert!(matches!(
        &failures[0].status,
        StageStatus::Failed { reason_code, .. } if reason_code == "source_unavailable"
    ));
    assert!(report
        .stages
        .iter()
        .filter(|s| s.stage != "ingest")
        .all(|s| s.succeeded()));

    let cursor = ProgressStore::new(storage).load_cursor("encounters").await.unwrap();
    assert_eq!(cursor.record.offset, 0);
    assert!(cursor.version.is_none());
}

/// Full pipeline over the local filesystem, then a restart over the same root.
#[tokio::test]
async fn test_local_fs_run_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalFsBackend::new(dir.path()).unwrap());
    let (first, source) = pipeline(Arc::clone(&storage));
    for event in encounter_history() {
        source.push_json(event);
    }
    let report = first.run_once().await;
    assert!(report.is_success(), "{report:?}");

    let exported = dir.path().join("export/organization_month/month=2025-01/data.parquet");
    let bytes = Bytes::from(std::fs::read(&exported).unwrap());
    let rows = parquet_util::read_mart(Mart::OrganizationMonth, &bytes).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key, "O1");
    assert_eq!(rows[0].name.as_deref(), Some("General Hospital"));
    assert!(rows.iter().all(|r| r.derived.is_some()));

    // New process, same storage root and the same upstream log.
    let restarted_storage = Arc::new(LocalFsBackend::new(dir.path()).unwrap());
    let (restarted, restarted_source) = pipeline(restarted_storage);
    for event in encounter_history() {
        restarted_source.push_json(event);
    }
    let report = restarted.run_once().await;
    assert!(report.is_success(), "{report:?}");
    let ingest = &report.stages[0];
    assert_eq!(ingest.summary.as_ref().unwrap()["records_written"], 0);
    for stage in report.stages.iter().filter(|s| s.stage == "export") {
        assert_eq!(stage.summary.as_ref().unwrap()["published"], serde_json::json!([]));
    }
}

/// A file source with an undecodable line and a half-written tail: the bad
/// line is quarantined, and the tail lands once its newline arrives.
#[tokio::test]
async fn test_json_lines_source_survives_bad_and_partial_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("encounters.jsonl");
    let first = EncounterBuilder::new("E1", "P1").build().to_string();
    let second = EncounterBuilder::new("E2", "P2").build().to_string();
    let (head, tail) = second.split_at(second.len() / 2);

    let mut contents = format!("{first}\n").into_bytes();
    contents.extend_from_slice(b"\xff\xfe garbage\n");
    contents.extend_from_slice(head.as_bytes());
    std::fs::write(&path, &contents).unwrap();

    let storage = Arc::new(MemoryBackend::new());
    let ingestor = RawIngestor::new(Arc::clone(&storage), PipelineConfig::default());
    let source = JsonLinesSource::new("encounters", &path);

    let result = ingestor.ingest(&source).await.unwrap();
    assert_eq!(result.records_written, 1);
    assert_eq!(result.records_quarantined, 1);
    assert_eq!(result.new_cursor, 2);

    contents.extend_from_slice(tail.as_bytes());
    contents.push(b'\n');
    std::fs::write(&path, &contents).unwrap();

    let result = ingestor.ingest(&source).await.unwrap();
    assert_eq!(result.records_written, 1);
    assert_eq!(result.records_quarantined, 0);
    assert_eq!(result.new_cursor, 3);

    let quarantined = StorageQuarantineSink::new(Arc::clone(&storage))
        .list("ingest", Some("encounters"))
        .await
        .unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].entry.offset, Some(1));
}
