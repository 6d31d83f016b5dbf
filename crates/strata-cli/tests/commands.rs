//! Command execution against a local storage root.

use std::path::Path;

use strata_cli::commands::{inspect, quarantine, run, status};
use strata_cli::{Config, OutputFormat};
use strata_pipeline::PipelineConfig;
use strata_test_utils::{encounter_history, EncounterBuilder};

fn config(root: &Path) -> Config {
    Config {
        pipeline: PipelineConfig {
            storage_root: root.join("store"),
            ..PipelineConfig::default()
        },
        format: OutputFormat::Json,
    }
}

fn write_inputs(root: &Path) {
    let mut lines: Vec<String> = encounter_history().iter().map(ToString::to_string).collect();
    lines.push("{broken".to_string());
    lines.push(EncounterBuilder::new("E99", "P99").without("patient_id").build().to_string());
    std::fs::write(root.join("encounters.jsonl"), lines.join("\n")).unwrap();

    let reference = root.join("reference");
    std::fs::create_dir_all(&reference).unwrap();
    std::fs::write(
        reference.join("payers.json"),
        r#"[{"Id": "Y1", "NAME": "Aetna"}, {"Id": "Y2", "NAME": "Medicare"}]"#,
    )
    .unwrap();
    std::fs::write(
        reference.join("organizations.jsonl"),
        concat!(
            r#"{"Id": "O1", "NAME": "General Hospital", "CITY": "Boston", "STATE": "MA"}"#,
            "\n",
            r#"{"Id": "O2", "NAME": "Harbor Clinic", "CITY": "Salem", "STATE": "MA"}"#,
        ),
    )
    .unwrap();
}

fn run_args(root: &Path) -> run::RunArgs {
    run::RunArgs {
        sources: vec![("encounters".to_string(), root.join("encounters.jsonl"))],
        reference_dir: Some(root.join("reference")),
        datasets: vec!["payers".to_string(), "organizations".to_string()],
    }
}

#[tokio::test]
async fn test_run_publishes_exports_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let config = config(dir.path());

    assert!(run::execute(run_args(dir.path()), &config).await.unwrap());
    let store = dir.path().join("store");
    assert!(store.join("export/department/month=2025-01/data.parquet").exists());
    assert!(store.join("export/payer/month=2025-02/data.parquet").exists());
    assert!(store.join("export/organization_month/_published.json").exists());

    // Second run over the same inputs succeeds and changes nothing.
    let before = std::fs::read(store.join("export/payer/_published.json")).unwrap();
    assert!(run::execute(run_args(dir.path()), &config).await.unwrap());
    let after = std::fs::read(store.join("export/payer/_published.json")).unwrap();
    assert_eq!(before, after);

    assert!(status::execute(status::StatusArgs { mart: None }, &config).await.unwrap());
    assert!(quarantine::execute(
        quarantine::QuarantineArgs {
            stage: "ingest".to_string(),
            scope: Some("encounters".to_string()),
        },
        &config,
    )
    .await
    .unwrap());
}

#[tokio::test]
async fn test_inspect_requires_view_or_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let listed = inspect::execute(
        inspect::InspectArgs {
            view: None,
            list: true,
            limit: 10,
        },
        &config,
    )
    .await;
    assert!(listed.unwrap());

    let missing = inspect::execute(
        inspect::InspectArgs {
            view: None,
            list: false,
            limit: 10,
        },
        &config,
    )
    .await;
    assert!(missing.is_err());

    let unknown = inspect::execute(
        inspect::InspectArgs {
            view: Some("gold.nothing".to_string()),
            list: false,
            limit: 10,
        },
        &config,
    )
    .await;
    assert!(unknown.is_err());
}

#[tokio::test]
async fn test_inspect_empty_view_renders() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        format: OutputFormat::Text,
        ..config(dir.path())
    };
    let shown = inspect::execute(
        inspect::InspectArgs {
            view: Some("gold.department".to_string()),
            list: false,
            limit: 10,
        },
        &config,
    )
    .await;
    assert!(shown.unwrap());
}
