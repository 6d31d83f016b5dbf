//! Status command - show cursors, watermarks and mart versions.

use anyhow::Result;
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use strata_pipeline::progress::ProgressStore;
use strata_pipeline::{Cursor, EntityType, Mart, Pipeline, Watermark};
use tabled::{Table, Tabled};

use crate::output::print_json;
use crate::{Config, OutputFormat};

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Show only this mart.
    #[arg(long, short = 'm')]
    pub mart: Option<Mart>,
}

#[derive(Debug, Serialize)]
struct MartStatus {
    mart: Mart,
    manifest_version: u64,
    partitions: usize,
    published_partitions: usize,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    cursors: Vec<Cursor>,
    watermarks: Vec<Watermark>,
    marts: Vec<MartStatus>,
}

#[derive(Tabled)]
struct ProgressRow {
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Position")]
    position: String,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if progress records cannot be read.
pub async fn execute(args: StatusArgs, config: &Config) -> Result<bool> {
    let storage = config.storage()?;
    let progress = ProgressStore::new(std::sync::Arc::clone(&storage));
    let pipeline = Pipeline::new(storage, config.pipeline.clone());

    let cursors = progress.list_cursors().await?;
    let mut watermarks = Vec::with_capacity(EntityType::ALL.len());
    for entity_type in EntityType::ALL {
        let mut watermark = progress.load_watermark(entity_type).await?.record;
        watermark.entity_type.get_or_insert(entity_type);
        watermarks.push(watermark);
    }

    let marts = args.mart.map_or_else(|| Mart::ALL.to_vec(), |m| vec![m]);
    let mut mart_status = Vec::with_capacity(marts.len());
    for mart in marts {
        let manifest = pipeline.engine().manifest(mart).await?.record;
        let published = pipeline.publisher().published(mart).await?.record;
        mart_status.push(MartStatus {
            mart,
            manifest_version: manifest.version,
            partitions: manifest.partitions.len(),
            published_partitions: published.partitions.len(),
            updated_at: manifest.updated_at,
        });
    }

    let report = StatusReport {
        cursors,
        watermarks,
        marts: mart_status,
    };
    match config.format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_text(&report),
        OutputFormat::Table => println!("{}", Table::new(rows(&report))),
    }
    Ok(true)
}

fn print_text(report: &StatusReport) {
    println!("{}", "Sources".bold());
    if report.cursors.is_empty() {
        println!("  (none ingested)");
    }
    for cursor in &report.cursors {
        let pending = if cursor.pending.is_some() {
            " (pending batch)".yellow().to_string()
        } else {
            String::new()
        };
        println!("  {:<20} offset {}{pending}", cursor.source_id, cursor.offset);
    }

    println!();
    println!("{}", "Watermarks".bold());
    for watermark in &report.watermarks {
        let name = watermark.entity_type.map_or("?", EntityType::as_str);
        let at = watermark
            .max_observed_event_time
            .map_or_else(|| "-".dimmed().to_string(), |t| t.to_rfc3339());
        println!("  {name:<20} {at}");
    }

    println!();
    println!("{}", "Marts".bold());
    for mart in &report.marts {
        println!(
            "  {:<20} v{} {} partitions ({} published)",
            mart.mart, mart.manifest_version, mart.partitions, mart.published_partitions
        );
    }
}

fn rows(report: &StatusReport) -> Vec<ProgressRow> {
    let cursors = report.cursors.iter().map(|c| ProgressRow {
        kind: "cursor",
        name: c.source_id.clone(),
        position: c.offset.to_string(),
    });
    let watermarks = report.watermarks.iter().map(|w| ProgressRow {
        kind: "watermark",
        name: w.entity_type.map_or("?", EntityType::as_str).to_string(),
        position: w
            .max_observed_event_time
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
    });
    let marts = report.marts.iter().map(|m| ProgressRow {
        kind: "mart",
        name: m.mart.to_string(),
        position: format!("v{} ({}/{} published)", m.manifest_version, m.published_partitions, m.partitions),
    });
    cursors.chain(watermarks).chain(marts).collect()
}
