//! Quarantine command - list rejected records.

use anyhow::Result;
use clap::Args;
use strata_pipeline::{QuarantineSink, StorageQuarantineSink};
use tabled::{Table, Tabled};

use crate::output::print_json;
use crate::{Config, OutputFormat};

/// Arguments for the quarantine command.
#[derive(Debug, Args)]
pub struct QuarantineArgs {
    /// Stage that rejected the records (`ingest` or `conform`).
    #[arg(long, default_value = "conform")]
    pub stage: String,

    /// Source id or entity type within the stage.
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(Tabled)]
struct QuarantineRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Quarantined")]
    quarantined_at: String,
}

/// Execute the quarantine command.
///
/// # Errors
///
/// Returns an error if the stage or scope name is invalid or records
/// cannot be read.
pub async fn execute(args: QuarantineArgs, config: &Config) -> Result<bool> {
    let sink = StorageQuarantineSink::new(config.storage()?);
    let records = sink.list(&args.stage, args.scope.as_deref()).await?;

    match config.format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No quarantined records for stage '{}'", args.stage);
            }
            for record in &records {
                let offset = record.entry.offset.map_or_else(|| "-".to_string(), |o| o.to_string());
                println!(
                    "  {} @{} {}: {}",
                    record.entry.scope, offset, record.reason.code, record.reason.message
                );
            }
        }
        OutputFormat::Table => {
            let rows: Vec<QuarantineRow> = records
                .iter()
                .map(|r| QuarantineRow {
                    scope: r.entry.scope.clone(),
                    offset: r.entry.offset.map_or_else(|| "-".to_string(), |o| o.to_string()),
                    reason: r
                        .reason
                        .detail
                        .as_ref()
                        .map_or_else(|| r.reason.code.clone(), |d| format!("{} ({d})", r.reason.code)),
                    quarantined_at: r.quarantined_at.to_rfc3339(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(true)
}
