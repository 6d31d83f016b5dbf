//! Logging setup and span helpers.
//!
//! Every stage run executes inside a span carrying the stage name, the scope
//! it owns (source, entity type or mart) and the run ID, so interleaved log
//! lines from parallel stages stay attributable.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Error;
use crate::id::RunId;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for scheduled runs).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}': expected json or pretty"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; only the first call installs a subscriber.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `strata_pipeline=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span for one stage run.
///
/// # Example
///
/// ```rust
/// use strata_core::id::RunId;
/// use strata_core::observability::stage_span;
///
/// let span = stage_span("conform", "encounter", RunId::generate());
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn stage_span(stage: &str, scope: &str, run_id: RunId) -> Span {
    tracing::info_span!(
        "stage",
        stage = stage,
        scope = scope,
        run_id = %run_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn stage_span_enters() {
        let span = stage_span("ingest", "encounters", RunId::generate());
        let _guard = span.enter();
        tracing::info!("inside stage span");
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
