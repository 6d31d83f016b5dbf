//! Shared rendering for command results.

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use serde::Serialize;
use strata_pipeline::{RunReport, StageOutcome, StageStatus};
use tabled::{Table, Tabled};

use crate::OutputFormat;

/// Prints any serializable value as pretty JSON.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

/// Colors a stage status for terminal output.
#[must_use]
pub fn format_status_colored(status: &StageStatus) -> String {
    match status {
        StageStatus::Succeeded => "SUCCEEDED".green().to_string(),
        StageStatus::Failed { reason_code, .. } => {
            format!("FAILED ({reason_code})").red().to_string()
        }
    }
}

#[derive(Tabled)]
struct StageRow {
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn detail(outcome: &StageOutcome) -> String {
    match &outcome.status {
        StageStatus::Succeeded => outcome
            .summary
            .as_ref()
            .map(summary_line)
            .unwrap_or_default(),
        StageStatus::Failed {
            message,
            affected_partitions,
            ..
        } if affected_partitions.is_empty() => message.clone(),
        StageStatus::Failed {
            message,
            affected_partitions,
            ..
        } => format!("{message} [{}]", affected_partitions.join(", ")),
    }
}

/// One-line digest of a stage summary: its numeric fields and list lengths.
fn summary_line(summary: &serde_json::Value) -> String {
    let Some(fields) = summary.as_object() else {
        return String::new();
    };
    fields
        .iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::Number(n) => Some(format!("{name}={n}")),
            serde_json::Value::Array(items) => Some(format!("{name}={}", items.len())),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prints a pipeline run report.
///
/// # Errors
///
/// Returns an error if JSON output cannot be serialized.
pub fn print_report(report: &RunReport, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Text => {
            println!("Run: {}", report.run_id);
            println!(
                "Duration: {} ms",
                (report.finished_at - report.started_at).num_milliseconds()
            );
            println!();
            for outcome in &report.stages {
                println!(
                    "  {:<10} {:<20} {} {}",
                    outcome.stage,
                    outcome.scope,
                    format_status_colored(&outcome.status),
                    detail(outcome)
                );
            }
        }
        OutputFormat::Table => {
            let rows: Vec<StageRow> = report
                .stages
                .iter()
                .map(|o| StageRow {
                    stage: o.stage.clone(),
                    scope: o.scope.clone(),
                    status: match &o.status {
                        StageStatus::Succeeded => "succeeded".to_string(),
                        StageStatus::Failed { reason_code, .. } => reason_code.clone(),
                    },
                    detail: detail(o),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

/// Prints a single stage outcome (used by the per-stage commands).
///
/// # Errors
///
/// Returns an error if JSON output cannot be serialized.
pub fn print_outcomes(outcomes: &[StageOutcome], format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(outcomes),
        OutputFormat::Text => {
            for outcome in outcomes {
                println!(
                    "{} {} {} {}",
                    outcome.stage,
                    outcome.scope,
                    format_status_colored(&outcome.status),
                    detail(outcome)
                );
            }
            Ok(())
        }
        OutputFormat::Table => {
            let rows: Vec<StageRow> = outcomes
                .iter()
                .map(|o| StageRow {
                    stage: o.stage.clone(),
                    scope: o.scope.clone(),
                    status: if o.succeeded() {
                        "succeeded".to_string()
                    } else {
                        "failed".to_string()
                    },
                    detail: detail(o),
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_line_counts_lists() {
        let line = summary_line(&json!({
            "mart": "payer",
            "published": ["month=2025-01"],
            "unchanged": [],
            "rows_written": 3
        }));
        assert_eq!(line, "published=1 rows_written=3 unchanged=0");
    }
}
