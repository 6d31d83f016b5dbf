//! Publish command - swap changed mart partitions into the export location.

use anyhow::Result;
use clap::Args;
use strata_pipeline::{Mart, Pipeline, StageOutcome};

use crate::output::print_outcomes;
use crate::Config;

/// Arguments for the publish command.
#[derive(Debug, Args)]
pub struct PublishArgs {
    /// Mart to publish; all marts when omitted.
    #[arg(long, short = 'm')]
    pub mart: Option<Mart>,
}

/// Execute the publish command.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or output fails.
pub async fn execute(args: PublishArgs, config: &Config) -> Result<bool> {
    let pipeline = Pipeline::new(config.storage()?, config.pipeline.clone());
    let publisher = pipeline.publisher();
    let marts = args.mart.map_or_else(|| Mart::ALL.to_vec(), |m| vec![m]);

    let mut outcomes = Vec::with_capacity(marts.len());
    for mart in marts {
        let result = publisher.publish(mart).await;
        outcomes.push(StageOutcome::from_result("export", mart.as_str(), &result));
    }
    print_outcomes(&outcomes, &config.format)?;
    Ok(outcomes.iter().all(StageOutcome::succeeded))
}
