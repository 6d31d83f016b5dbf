//! # strata-cli
//!
//! Command-line interface for the strata pipeline.
//!
//! ## Commands
//!
//! - `strata ingest` - Land new records from a JSON Lines source
//! - `strata ingest-reference` - Land reference datasets if they changed
//! - `strata conform` - Merge raw records into the conformed tier
//! - `strata aggregate` - Rebuild affected mart partitions
//! - `strata publish` - Swap changed mart partitions into the export location
//! - `strata run` - Run every stage once
//! - `strata status` - Show cursors, watermarks and mart versions
//! - `strata quarantine` - List quarantined records
//! - `strata inspect` - Render an admin view
//!
//! ## Configuration
//!
//! Settings come from `STRATA_*` environment variables (see
//! [`PipelineConfig::from_env`]); the flags below override them:
//!
//! - `STRATA_STORAGE_ROOT` - Storage root directory (default: `./strata-data`)
//! - `STRATA_INGEST_BATCH_SIZE` - Records pulled per ingest run
//! - `STRATA_GRACE_WINDOW_SECS` - Late-data grace window
//! - `STRATA_LOG_FORMAT` - `pretty` or `json`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strata_core::{LocalFsBackend, LogFormat};
use strata_pipeline::PipelineConfig;

/// Strata CLI - tiered pipeline command-line interface.
#[derive(Debug, Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Storage root directory.
    #[arg(long, env = "STRATA_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,

    /// Records pulled from a source per ingest run.
    #[arg(long, env = "STRATA_INGEST_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Late-data grace window in seconds.
    #[arg(long, env = "STRATA_GRACE_WINDOW_SECS")]
    pub grace_window_secs: Option<u64>,

    /// Log output format (`pretty` or `json`).
    #[arg(long, env = "STRATA_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Builds the pipeline configuration: environment first, then flags.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable or flag is invalid.
    pub fn config(&self) -> Result<Config> {
        let mut pipeline = PipelineConfig::from_env().context("invalid STRATA_* environment")?;
        if let Some(root) = &self.storage_root {
            pipeline.storage_root.clone_from(root);
        }
        if let Some(size) = self.batch_size {
            pipeline.ingest_batch_size = size;
        }
        if let Some(secs) = self.grace_window_secs {
            pipeline.grace_window = Duration::from_secs(secs);
        }
        if let Some(format) = &self.log_format {
            pipeline.log_format = format.parse::<LogFormat>()?;
        }
        pipeline.validate().context("invalid configuration")?;

        Ok(Config {
            pipeline,
            format: self.format.clone(),
        })
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Land new records from a JSON Lines source.
    Ingest(commands::ingest::IngestArgs),
    /// Land reference datasets whose content changed.
    IngestReference(commands::ingest_reference::IngestReferenceArgs),
    /// Merge raw records into the conformed tier.
    Conform(commands::conform::ConformArgs),
    /// Rebuild affected mart partitions.
    Aggregate(commands::aggregate::AggregateArgs),
    /// Publish mart partitions to the export location.
    Publish(commands::publish::PublishArgs),
    /// Run every stage once.
    Run(commands::run::RunArgs),
    /// Show pipeline progress.
    Status(commands::status::StatusArgs),
    /// List quarantined records.
    Quarantine(commands::quarantine::QuarantineArgs),
    /// Render an admin view.
    Inspect(commands::inspect::InspectArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Output format.
    pub format: OutputFormat,
}

impl Config {
    /// Opens the local filesystem backend at the configured root.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn storage(&self) -> Result<Arc<LocalFsBackend>> {
        let root = &self.pipeline.storage_root;
        let backend = LocalFsBackend::new(root.clone())
            .with_context(|| format!("cannot open storage root {}", root.display()))?;
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_from_flags() {
        let cli = Cli::parse_from([
            "strata",
            "--storage-root",
            "/tmp/strata-test",
            "--batch-size",
            "50",
            "--grace-window-secs",
            "600",
            "--format",
            "json",
            "status",
        ]);

        let config = cli.config().unwrap();
        assert_eq!(config.pipeline.storage_root, PathBuf::from("/tmp/strata-test"));
        assert_eq!(config.pipeline.ingest_batch_size, 50);
        assert_eq!(config.pipeline.grace_window, Duration::from_secs(600));
        assert!(matches!(config.format, OutputFormat::Json));
        assert!(matches!(cli.command, Commands::Status(_)));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let cli = Cli::parse_from(["strata", "--batch-size", "0", "status"]);
        assert!(cli.config().is_err());
    }

    #[test]
    fn test_stage_subcommands_parse() {
        let cli = Cli::parse_from(["strata", "conform", "--entity", "encounter"]);
        assert!(matches!(cli.command, Commands::Conform(_)));
        let cli = Cli::parse_from(["strata", "aggregate", "--mart", "payer"]);
        assert!(matches!(cli.command, Commands::Aggregate(_)));
        let cli = Cli::parse_from(["strata", "inspect", "gold.department", "--limit", "5"]);
        assert!(matches!(cli.command, Commands::Inspect(_)));
    }
}
