//! Ingest-reference command - land reference datasets that changed.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use strata_pipeline::{JsonFileReferenceLoader, Pipeline, StageOutcome};

use crate::output::print_outcomes;
use crate::Config;

/// Arguments for the ingest-reference command.
#[derive(Debug, Args)]
pub struct IngestReferenceArgs {
    /// Directory holding `{name}.json` or `{name}.jsonl` extracts.
    #[arg(long, short = 'd')]
    pub dir: PathBuf,

    /// Datasets to load (comma-separated or repeated).
    #[arg(
        long = "dataset",
        value_delimiter = ',',
        default_value = "patients,payers,organizations"
    )]
    pub datasets: Vec<String>,
}

/// Execute the ingest-reference command.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or output fails.
pub async fn execute(args: IngestReferenceArgs, config: &Config) -> Result<bool> {
    let pipeline = Pipeline::new(config.storage()?, config.pipeline.clone());
    let loader = JsonFileReferenceLoader::new(args.dir);
    let ingestor = pipeline.ingestor();

    let mut outcomes = Vec::with_capacity(args.datasets.len());
    for name in &args.datasets {
        let result = ingestor.ingest_reference(&loader, name).await;
        outcomes.push(StageOutcome::from_result("ingest", name.as_str(), &result));
    }
    print_outcomes(&outcomes, &config.format)?;
    Ok(outcomes.iter().all(StageOutcome::succeeded))
}
