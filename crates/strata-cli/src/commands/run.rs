//! Run command - execute every stage once.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use strata_pipeline::{EventSource, JsonFileReferenceLoader, JsonLinesSource, Pipeline};

use crate::output::print_report;
use crate::Config;

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Event source as `id=path.jsonl` (repeatable).
    #[arg(long = "source", short = 's', value_parser = parse_source)]
    pub sources: Vec<(String, PathBuf)>,

    /// Directory of reference extracts to load before conforming.
    #[arg(long)]
    pub reference_dir: Option<PathBuf>,

    /// Reference datasets to load from `--reference-dir`.
    #[arg(
        long = "dataset",
        value_delimiter = ',',
        default_value = "patients,payers,organizations"
    )]
    pub datasets: Vec<String>,
}

/// Parses an `id=path` source argument.
fn parse_source(s: &str) -> Result<(String, PathBuf), String> {
    let (id, path) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid source '{s}': expected id=path"))?;
    if id.is_empty() || path.is_empty() {
        return Err(format!("invalid source '{s}': expected id=path"));
    }
    Ok((id.to_string(), PathBuf::from(path)))
}

/// Execute the run command.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or output fails. Stage
/// failures are part of the printed report.
pub async fn execute(args: RunArgs, config: &Config) -> Result<bool> {
    let mut pipeline = Pipeline::new(config.storage()?, config.pipeline.clone());
    for (id, path) in args.sources {
        pipeline = pipeline.with_source(Arc::new(JsonLinesSource::new(id, path)) as Arc<dyn EventSource>);
    }
    if let Some(dir) = args.reference_dir {
        pipeline = pipeline.with_reference_loader(Arc::new(JsonFileReferenceLoader::new(dir)), args.datasets);
    }

    let report = pipeline.run_once().await;
    print_report(&report, &config.format)?;
    Ok(report.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source() {
        assert_eq!(
            parse_source("encounters=data/enc.jsonl").unwrap(),
            ("encounters".to_string(), PathBuf::from("data/enc.jsonl"))
        );
        assert!(parse_source("encounters").is_err());
        assert!(parse_source("=data/enc.jsonl").is_err());
    }

    #[test]
    fn test_run_args_parsing() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: RunArgs,
        }

        let cli = TestCli::parse_from([
            "test",
            "-s",
            "encounters=enc.jsonl",
            "--source",
            "claims=claims.jsonl",
            "--reference-dir",
            "ref",
            "--dataset",
            "payers",
        ]);
        assert_eq!(cli.args.sources.len(), 2);
        assert_eq!(cli.args.sources[1].0, "claims");
        assert_eq!(cli.args.reference_dir, Some(PathBuf::from("ref")));
        assert_eq!(cli.args.datasets, vec!["payers"]);
    }
}
