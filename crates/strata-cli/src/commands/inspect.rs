//! Inspect command - render an admin view.

use anyhow::{Context, Result};
use arrow::util::pretty::pretty_format_batches;
use clap::Args;
use strata_pipeline::Pipeline;

use crate::output::print_json;
use crate::{Config, OutputFormat};

/// Arguments for the inspect command.
#[derive(Debug, Args)]
pub struct InspectArgs {
    /// View name, e.g. `conformed.encounter` or `gold.department`.
    #[arg()]
    pub view: Option<String>,

    /// List the available views.
    #[arg(long, short = 'l')]
    pub list: bool,

    /// Maximum rows to print.
    #[arg(long, default_value = "50")]
    pub limit: usize,
}

/// Execute the inspect command.
///
/// # Errors
///
/// Returns an error if the view is unknown or cannot be read.
pub async fn execute(args: InspectArgs, config: &Config) -> Result<bool> {
    let pipeline = Pipeline::new(config.storage()?, config.pipeline.clone());
    let views = pipeline.views();

    if args.list {
        let names: Vec<String> = views.list_views().iter().map(ToString::to_string).collect();
        match config.format {
            OutputFormat::Json => print_json(&names)?,
            OutputFormat::Text | OutputFormat::Table => {
                for name in names {
                    println!("{name}");
                }
            }
        }
        return Ok(true);
    }

    let Some(view) = args.view else {
        anyhow::bail!("Either provide a view name or use --list to see available views")
    };
    let batches = views.read_view(&view).await?;

    let mut remaining = args.limit;
    let mut limited = Vec::with_capacity(batches.len());
    for batch in batches {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(batch.num_rows());
        limited.push(batch.slice(0, take));
        remaining -= take;
    }

    match config.format {
        OutputFormat::Json => {
            let mut writer = arrow::json::ArrayWriter::new(Vec::new());
            let refs: Vec<_> = limited.iter().collect();
            writer.write_batches(&refs).context("Failed to encode view rows")?;
            writer.finish().context("Failed to encode view rows")?;
            let rows: serde_json::Value = serde_json::from_slice(&writer.into_inner())
                .context("Failed to encode view rows")?;
            print_json(&rows)?;
        }
        OutputFormat::Text | OutputFormat::Table => {
            if limited.is_empty() {
                println!("View '{view}' is empty");
            } else {
                println!("{}", pretty_format_batches(&limited).context("Failed to render view")?);
            }
        }
    }
    Ok(true)
}
