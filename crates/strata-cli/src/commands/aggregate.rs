//! Aggregate command - rebuild affected mart partitions.

use anyhow::{Context, Result};
use clap::Args;
use strata_core::PartitionKey;
use strata_pipeline::{Mart, Pipeline, StageOutcome};

use crate::output::print_outcomes;
use crate::Config;

/// Arguments for the aggregate command.
#[derive(Debug, Args)]
pub struct AggregateArgs {
    /// Mart to build; all marts when omitted.
    #[arg(long, short = 'm')]
    pub mart: Option<Mart>,

    /// Rebuild these partitions (e.g. `month=2025-01`) instead of the affected ones.
    #[arg(long = "partition", value_delimiter = ',', requires = "mart")]
    pub partitions: Vec<String>,
}

/// Execute the aggregate command.
///
/// # Errors
///
/// Returns an error if a partition key is invalid, storage cannot be
/// opened, or output fails.
pub async fn execute(args: AggregateArgs, config: &Config) -> Result<bool> {
    let pipeline = Pipeline::new(config.storage()?, config.pipeline.clone());
    let engine = pipeline.engine();

    let results = match args.mart {
        Some(mart) => {
            let result = if args.partitions.is_empty() {
                match engine.affected_partitions(mart).await {
                    Ok(affected) => engine.aggregate(mart, &affected).await,
                    Err(e) => Err(e),
                }
            } else {
                let partitions = args
                    .partitions
                    .iter()
                    .map(|p| PartitionKey::parse(p).with_context(|| format!("invalid partition '{p}'")))
                    .collect::<Result<Vec<_>>>()?;
                engine.aggregate(mart, &partitions).await
            };
            vec![(mart, result)]
        }
        None => engine.aggregate_all().await,
    };

    let outcomes: Vec<StageOutcome> = results
        .iter()
        .map(|(mart, result)| StageOutcome::from_result("aggregate", mart.as_str(), result))
        .collect();
    print_outcomes(&outcomes, &config.format)?;
    Ok(outcomes.iter().all(StageOutcome::succeeded))
}
