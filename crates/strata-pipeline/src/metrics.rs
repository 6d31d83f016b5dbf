//! Pipeline metrics.
//!
//! Counters and histograms go through the `metrics` facade; the embedding
//! binary decides whether an exporter is installed.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Stage Metrics
// ============================================================================

/// Records landed in the raw tier.
pub const RECORDS_INGESTED: &str = "strata_records_ingested_total";

/// Records routed to quarantine.
pub const RECORDS_QUARANTINED: &str = "strata_records_quarantined_total";

/// Conformed entities whose state changed.
pub const ENTITIES_UPSERTED: &str = "strata_entities_upserted_total";

/// Rows written to mart partitions.
pub const MART_ROWS_WRITTEN: &str = "strata_mart_rows_written_total";

/// Export partitions swapped into place.
pub const EXPORT_PARTITIONS_PUBLISHED: &str = "strata_export_partitions_published_total";

/// Stage run duration histogram.
pub const STAGE_DURATION: &str = "strata_stage_duration_seconds";

// ============================================================================
// CAS Metrics
// ============================================================================

/// CAS retry counter.
pub const CAS_RETRY: &str = "strata_cas_retry_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all pipeline metric descriptions.
///
/// Call once at startup after installing a metrics recorder.
pub fn register_metrics() {
    describe_counter!(RECORDS_INGESTED, "Total records landed in the raw tier");
    describe_counter!(RECORDS_QUARANTINED, "Total records routed to quarantine");
    describe_counter!(ENTITIES_UPSERTED, "Total conformed entities changed by upserts");
    describe_counter!(MART_ROWS_WRITTEN, "Total rows written to mart partitions");
    describe_counter!(
        EXPORT_PARTITIONS_PUBLISHED,
        "Total export partitions swapped into place"
    );
    describe_histogram!(STAGE_DURATION, "Duration of stage runs in seconds");
    describe_counter!(CAS_RETRY, "Total CAS retry attempts");
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records a completed ingest batch.
pub fn record_ingest(source: &str, written: u64, quarantined: u64) {
    counter!(RECORDS_INGESTED, "source" => source.to_string()).increment(written);
    if quarantined > 0 {
        record_quarantined("ingest", source, quarantined);
    }
}

/// Records quarantined records for a stage scope.
pub fn record_quarantined(stage: &str, scope: &str, count: u64) {
    let labels = [("stage", stage.to_string()), ("scope", scope.to_string())];
    counter!(RECORDS_QUARANTINED, &labels).increment(count);
}

/// Records entities changed by a conformance run.
pub fn record_upserts(entity_type: &str, count: u64) {
    counter!(ENTITIES_UPSERTED, "entity_type" => entity_type.to_string()).increment(count);
}

/// Records rows written by an aggregation run.
pub fn record_mart_rows(mart: &str, rows: u64) {
    counter!(MART_ROWS_WRITTEN, "mart" => mart.to_string()).increment(rows);
}

/// Records partitions published by an export run.
pub fn record_published(mart: &str, partitions: u64) {
    counter!(EXPORT_PARTITIONS_PUBLISHED, "mart" => mart.to_string()).increment(partitions);
}

/// Records a stage run duration with its outcome.
pub fn record_stage_duration(stage: &str, outcome: &str, duration_secs: f64) {
    let labels = [("stage", stage.to_string()), ("outcome", outcome.to_string())];
    histogram!(STAGE_DURATION, &labels).record(duration_secs);
}

/// Records a CAS retry attempt.
pub fn record_cas_retry(operation: &str) {
    counter!(CAS_RETRY, "operation" => operation.to_string()).increment(1);
}

/// Records a stage run's duration, labelled with its outcome code.
pub(crate) fn record_stage_outcome<T>(
    stage: &str,
    started: std::time::Instant,
    result: &crate::error::Result<T>,
) {
    let outcome = match result {
        Ok(_) => "succeeded",
        Err(e) => e.reason_code(),
    };
    record_stage_duration(stage, outcome, started.elapsed().as_secs_f64());
}
