//! Ingest command - land new records from a JSON Lines source.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use strata_pipeline::{JsonLinesSource, StageOutcome};

use crate::output::print_outcomes;
use crate::Config;

/// Arguments for the ingest command.
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Source identifier (raw-tier directory and cursor name).
    #[arg(long, short = 's')]
    pub source: String,

    /// JSON Lines file to read; line numbers are offsets.
    #[arg(long, short = 'f')]
    pub file: PathBuf,
}

/// Execute the ingest command.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or output fails. A failed
/// ingest is reported, not returned.
pub async fn execute(args: IngestArgs, config: &Config) -> Result<bool> {
    let pipeline = strata_pipeline::Pipeline::new(config.storage()?, config.pipeline.clone());
    let source = JsonLinesSource::new(args.source.clone(), args.file);
    let result = pipeline.ingestor().ingest(&source).await;
    let outcome = StageOutcome::from_result("ingest", args.source, &result);
    print_outcomes(std::slice::from_ref(&outcome), &config.format)?;
    Ok(outcome.succeeded())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_args_parsing() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: IngestArgs,
        }

        let cli = TestCli::parse_from(["test", "--source", "encounters", "--file", "events.jsonl"]);
        assert_eq!(cli.args.source, "encounters");
        assert_eq!(cli.args.file, PathBuf::from("events.jsonl"));
    }
}
