//! Conform command - merge raw records into the conformed tier.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use strata_pipeline::{EntityType, Pipeline, StageOutcome};

use crate::output::print_outcomes;
use crate::Config;

/// Arguments for the conform command.
#[derive(Debug, Args)]
pub struct ConformArgs {
    /// Entity type to conform; all types when omitted.
    #[arg(long, short = 'e')]
    pub entity: Option<EntityType>,

    /// Reprocess from this event time (RFC 3339) instead of the stored watermark.
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,
}

/// Execute the conform command.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or output fails.
pub async fn execute(args: ConformArgs, config: &Config) -> Result<bool> {
    let pipeline = Pipeline::new(config.storage()?, config.pipeline.clone());
    let transformer = pipeline.transformer();

    let results = match args.entity {
        Some(entity) => vec![(entity, transformer.conform(entity, args.since).await)],
        None if args.since.is_some() => {
            let mut results = Vec::new();
            for entity in EntityType::ALL {
                results.push((entity, transformer.conform(entity, args.since).await));
            }
            results
        }
        None => transformer.conform_all().await,
    };

    let outcomes: Vec<StageOutcome> = results
        .iter()
        .map(|(entity, result)| StageOutcome::from_result("conform", entity.as_str(), result))
        .collect();
    print_outcomes(&outcomes, &config.format)?;
    Ok(outcomes.iter().all(StageOutcome::succeeded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conform_args_parse_since() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: ConformArgs,
        }

        let cli = TestCli::parse_from([
            "test",
            "--entity",
            "payer",
            "--since",
            "2025-01-10T00:00:00Z",
        ]);
        assert_eq!(cli.args.entity, Some(EntityType::Payer));
        assert!(cli.args.since.is_some());
    }
}
