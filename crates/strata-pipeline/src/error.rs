//! Stage-level error taxonomy.
//!
//! Every failure a stage can surface maps to one [`PipelineError`] variant
//! with a stable [`reason_code`](PipelineError::reason_code) for run reports
//! and an [`is_retryable`](PipelineError::is_retryable) classification for
//! schedulers:
//!
//! | Variant | Level | Handling |
//! |---------|-------|----------|
//! | `SourceUnavailable` | source | retry with backoff |
//! | `SchemaViolation` | record | quarantine and continue |
//! | `MergeConflict` | run | serialize and retry |
//! | `PartialWriteFailure` | batch | progress markers untouched, retry whole batch |
//! | `ExportRaceCondition` | publisher | retry with a fresh staging write |

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Record-level validation failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Payload could not be framed as a JSON object.
    Unframeable,
    /// Natural key missing or empty.
    MissingNaturalKey,
    /// A required non-key field is missing.
    MissingField,
    /// A known field had the wrong JSON type or an unparsable value.
    WrongType,
    /// Age outside the plausible range.
    ImplausibleAge,
    /// Timestamp later than ingestion time plus clock-skew tolerance.
    FutureTimestamp,
    /// Discharge recorded before admission.
    DischargeBeforeAdmission,
    /// Negative cost or coverage amount.
    NegativeAmount,
}

impl ViolationKind {
    /// Stable snake_case code used in quarantine records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unframeable => "unframeable",
            Self::MissingNaturalKey => "missing_natural_key",
            Self::MissingField => "missing_field",
            Self::WrongType => "wrong_type",
            Self::ImplausibleAge => "implausible_age",
            Self::FutureTimestamp => "future_timestamp",
            Self::DischargeBeforeAdmission => "discharge_before_admission",
            Self::NegativeAmount => "negative_amount",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The event source or reference loader could not be reached.
    #[error("source '{source_id}' unavailable: {message}")]
    SourceUnavailable {
        /// Source that failed.
        source_id: String,
        /// Failure detail.
        message: String,
    },

    /// A single record failed framing or validation.
    #[error("schema violation ({kind}): {message}")]
    SchemaViolation {
        /// Violation category.
        kind: ViolationKind,
        /// Human-readable detail.
        message: String,
    },

    /// Another run holds or changed the same entity type's conformed state.
    #[error("merge conflict on {scope}: {message}")]
    MergeConflict {
        /// Entity type or progress record that conflicted.
        scope: String,
        /// Conflict detail.
        message: String,
    },

    /// A batch failed after some of its writes landed; nothing was committed.
    #[error("partial write failure in {scope}: {message}")]
    PartialWriteFailure {
        /// Stage scope (source, entity type, or mart).
        scope: String,
        /// Partitions whose writes were attempted.
        affected_partitions: Vec<String>,
        /// Failure detail.
        message: String,
    },

    /// The export target changed between staging and swap.
    #[error("export race on {mart}/{partition}")]
    ExportRaceCondition {
        /// Mart being published.
        mart: String,
        /// Partition whose swap lost the race.
        partition: String,
    },

    /// The single-writer lease for a scope is held by another run.
    #[error("lease busy for {scope}: {message}")]
    LeaseBusy {
        /// Lease scope (e.g. `ingest/encounters`).
        scope: String,
        /// Holder detail.
        message: String,
    },

    /// A commit carried an older fencing token than the stored record.
    #[error("stale writer on {path}: stored token {stored}, attempted {attempted}")]
    StaleWriter {
        /// Progress record path.
        path: String,
        /// Token of the record's last writer.
        stored: u64,
        /// Token presented by this run.
        attempted: u64,
    },

    /// Shared primitive failure (storage, lease, identifiers).
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    /// Parquet or Arrow encoding failure.
    #[error("parquet error: {message}")]
    Parquet {
        /// Failure detail.
        message: String,
    },

    /// JSON encoding or decoding failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// Failure detail.
        message: String,
    },

    /// Invalid pipeline configuration or unknown stage target.
    #[error("configuration error: {message}")]
    Config {
        /// Failure detail.
        message: String,
    },
}

impl PipelineError {
    /// Builds a schema violation.
    #[must_use]
    pub fn violation(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            kind,
            message: message.into(),
        }
    }

    /// Stable snake_case reason code for reports and quarantine records.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::PartialWriteFailure { .. } => "partial_write_failure",
            Self::ExportRaceCondition { .. } => "export_race_condition",
            Self::LeaseBusy { .. } => "lease_busy",
            Self::StaleWriter { .. } => "stale_writer",
            Self::Core(strata_core::Error::NotFound(_)) => "not_found",
            Self::Core(strata_core::Error::PreconditionFailed { .. }) => "precondition_failed",
            Self::Core(_) => "storage",
            Self::Parquet { .. } => "parquet",
            Self::Serialization { .. } => "serialization",
            Self::Config { .. } => "config",
        }
    }

    /// Returns true if rerunning the same stage may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable { .. }
            | Self::MergeConflict { .. }
            | Self::PartialWriteFailure { .. }
            | Self::ExportRaceCondition { .. }
            | Self::LeaseBusy { .. } => true,
            Self::Core(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Partitions affected by a failed batch, if known.
    #[must_use]
    pub fn affected_partitions(&self) -> &[String] {
        match self {
            Self::PartialWriteFailure {
                affected_partitions,
                ..
            } => affected_partitions,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<parquet::errors::ParquetError> for PipelineError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Self::Parquet {
            message: e.to_string(),
        }
    }
}

impl From<arrow::error::ArrowError> for PipelineError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::Parquet {
            message: e.to_string(),
        }
    }
}
