//! Strata CLI - Command-line interface for the tiered pipeline.
//!
//! The main entry point for the `strata` CLI binary.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use strata_cli::{Cli, Commands};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.config()?;
    strata_core::init_logging(config.pipeline.log_format);
    strata_pipeline::metrics::register_metrics();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let succeeded = runtime.block_on(async {
        match cli.command {
            Commands::Ingest(args) => strata_cli::commands::ingest::execute(args, &config).await,
            Commands::IngestReference(args) => {
                strata_cli::commands::ingest_reference::execute(args, &config).await
            }
            Commands::Conform(args) => strata_cli::commands::conform::execute(args, &config).await,
            Commands::Aggregate(args) => strata_cli::commands::aggregate::execute(args, &config).await,
            Commands::Publish(args) => strata_cli::commands::publish::execute(args, &config).await,
            Commands::Run(args) => strata_cli::commands::run::execute(args, &config).await,
            Commands::Status(args) => strata_cli::commands::status::execute(args, &config).await,
            Commands::Quarantine(args) => {
                strata_cli::commands::quarantine::execute(args, &config).await
            }
            Commands::Inspect(args) => strata_cli::commands::inspect::execute(args, &config).await,
        }
    })?;

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
