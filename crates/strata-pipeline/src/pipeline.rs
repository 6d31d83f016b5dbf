//! One-shot pipeline runner: ingest, conform, aggregate, publish.
//!
//! Each stage is independently triggerable through its own component; the
//! runner only sequences them once and collects a report. A failed stage is
//! reported with its reason code and affected partitions and leaves its
//! progress markers where they were; later stages still run against the
//! last committed upstream state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use strata_core::storage::StorageBackend;
use strata_core::{stage_span, RunId};

use crate::aggregate::AggregationEngine;
use crate::config::PipelineConfig;
use crate::conform::ConformanceTransformer;
use crate::error::PipelineError;
use crate::export::ExportPublisher;
use crate::mart::Mart;
use crate::raw::RawIngestor;
use crate::reference::ReferenceLoader;
use crate::source::EventSource;
use crate::views::AdminViews;

/// Final state of one stage unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    /// The unit committed (possibly with nothing to do).
    Succeeded,
    /// The unit failed; nothing it owns was advanced.
    Failed {
        /// Stable reason code.
        reason_code: String,
        /// Error message.
        message: String,
        /// Partitions the failure left unpublished.
        affected_partitions: Vec<String>,
    },
}

/// Outcome of one stage unit (one source, entity type, or mart).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Stage name.
    pub stage: String,
    /// Source, entity type, or mart.
    pub scope: String,
    /// Result.
    #[serde(flatten)]
    pub status: StageStatus,
    /// Stage-specific result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl StageOutcome {
    /// Builds an outcome from a stage result, keeping its summary on success.
    pub fn from_result<T: Serialize>(
        stage: &str,
        scope: impl Into<String>,
        result: &Result<T, PipelineError>,
    ) -> Self {
        let (status, summary) = match result {
            Ok(value) => (StageStatus::Succeeded, serde_json::to_value(value).ok()),
            Err(e) => (
                StageStatus::Failed {
                    reason_code: e.reason_code().to_string(),
                    message: e.to_string(),
                    affected_partitions: e.affected_partitions().to_vec(),
                },
                None,
            ),
        };
        Self {
            stage: stage.to_string(),
            scope: scope.into(),
            status,
            summary,
        }
    }

    /// Returns true if the unit succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

/// Report of one `run_once` pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: RunId,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Stage outcomes in execution order.
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    /// Returns true if every stage unit succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageOutcome::succeeded)
    }

    /// Stage units that failed.
    pub fn failures(&self) -> impl Iterator<Item = &StageOutcome> {
        self.stages.iter().filter(|s| !s.succeeded())
    }
}

/// Wires sources and stages over one storage backend.
pub struct Pipeline<S> {
    storage: Arc<S>,
    config: PipelineConfig,
    sources: Vec<Arc<dyn EventSource>>,
    reference_loader: Option<Arc<dyn ReferenceLoader>>,
    reference_sources: Vec<String>,
}

impl<S> std::fmt::Debug for Pipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.source_id()).collect::<Vec<_>>(),
            )
            .field("reference_sources", &self.reference_sources)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend> Pipeline<S> {
    /// Creates a pipeline with no sources.
    #[must_use]
    pub fn new(storage: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            storage,
            config,
            sources: Vec::new(),
            reference_loader: None,
            reference_sources: Vec::new(),
        }
    }

    /// Adds an event source.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Sets the reference loader and the datasets to load each run.
    #[must_use]
    pub fn with_reference_loader(
        mut self,
        loader: Arc<dyn ReferenceLoader>,
        sources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.reference_loader = Some(loader);
        self.reference_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Raw ingestor over this pipeline's storage.
    #[must_use]
    pub fn ingestor(&self) -> RawIngestor<S> {
        RawIngestor::new(Arc::clone(&self.storage), self.config.clone())
    }

    /// Conformance transformer over this pipeline's storage.
    #[must_use]
    pub fn transformer(&self) -> ConformanceTransformer<S> {
        ConformanceTransformer::new(Arc::clone(&self.storage), self.config.clone())
    }

    /// Aggregation engine over this pipeline's storage.
    #[must_use]
    pub fn engine(&self) -> AggregationEngine<S> {
        AggregationEngine::new(Arc::clone(&self.storage), self.config.clone())
    }

    /// Export publisher over this pipeline's storage.
    #[must_use]
    pub fn publisher(&self) -> ExportPublisher<S> {
        ExportPublisher::new(Arc::clone(&self.storage), self.config.clone())
    }

    /// Admin views over this pipeline's storage.
    #[must_use]
    pub fn views(&self) -> AdminViews<S> {
        AdminViews::new(Arc::clone(&self.storage), self.config.clone())
    }

    /// Runs every stage once and reports per-unit outcomes.
    pub async fn run_once(&self) -> RunReport {
        let run_id = RunId::generate();
        let started_at = Utc::now();
        let mut stages = Vec::new();

        let ingestor = self.ingestor();
        let ingested = join_all(self.sources.iter().map(|source| {
            let span = stage_span("ingest", source.source_id(), run_id);
            let ingestor = &ingestor;
            async move {
                let result = ingestor.ingest(source.as_ref()).await;
                StageOutcome::from_result("ingest", source.source_id(), &result)
            }
            .instrument(span)
        }))
        .await;
        stages.extend(ingested);

        if let Some(loader) = &self.reference_loader {
            for name in &self.reference_sources {
                let result = ingestor
                    .ingest_reference(loader.as_ref(), name)
                    .instrument(stage_span("ingest", name, run_id))
                    .await;
                stages.push(StageOutcome::from_result("ingest", name.as_str(), &result));
            }
        }

        let conformed = self
            .transformer()
            .conform_all()
            .instrument(stage_span("conform", "all", run_id))
            .await;
        stages.extend(
            conformed
                .iter()
                .map(|(entity, result)| StageOutcome::from_result("conform", entity.as_str(), result)),
        );

        let aggregated = self
            .engine()
            .aggregate_all()
            .instrument(stage_span("aggregate", "all", run_id))
            .await;
        let built: Vec<Mart> = aggregated
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(mart, _)| *mart)
            .collect();
        stages.extend(
            aggregated
                .iter()
                .map(|(mart, result)| StageOutcome::from_result("aggregate", mart.as_str(), result)),
        );

        let publisher = self.publisher();
        for mart in built {
            let result = publisher
                .publish(mart)
                .instrument(stage_span("export", mart.as_str(), run_id))
                .await;
            stages.push(StageOutcome::from_result("export", mart.as_str(), &result));
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stages,
        };
        if report.is_success() {
            tracing::info!(run_id = %run_id, stages = report.stages.len(), "pipeline run succeeded");
        } else {
            for failure in report.failures() {
                if let StageStatus::Failed {
                    reason_code,
                    affected_partitions,
                    ..
                } = &failure.status
                {
                    tracing::error!(
                        run_id = %run_id,
                        stage = %failure.stage,
                        scope = %failure.scope,
                        reason = %reason_code,
                        partitions = ?affected_partitions,
                        "stage failed"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{MemoryReferenceLoader, ReferenceRow};
    use crate::source::MemoryEventSource;
    use serde_json::json;
    use strata_core::storage::MemoryBackend;

    fn payer_row(id: &str, name: &str) -> ReferenceRow {
        ReferenceRow::from([("Id".to_string(), id.to_string()), ("NAME".to_string(), name.to_string())])
    }

    #[tokio::test]
    async fn run_once_reaches_export() {
        let storage = Arc::new(MemoryBackend::new());
        let source = Arc::new(MemoryEventSource::new("encounters"));
        source.push_json(json!({
            "encounter_id": "E1", "patient_id": "P1", "department": "Cardiology",
            "payer_id": "Y1", "total_claim_cost": 200.0, "payer_coverage": 150.0,
            "admission_time": "2025-01-10T08:00:00Z", "discharge_time": "2025-01-10T12:00:00Z"
        }));
        let loader = Arc::new(MemoryReferenceLoader::new());
        loader.set("payers", vec![payer_row("Y1", "Aetna")]);

        let pipeline = Pipeline::new(Arc::clone(&storage), PipelineConfig::default())
            .with_source(source)
            .with_reference_loader(loader, ["payers"]);
        let report = pipeline.run_once().await;
        assert!(report.is_success(), "{report:?}");

        let batches = pipeline.views().read_view("gold.payer").await.unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
        assert!(storage
            .head("export/payer/month=2025-01/data.parquet")
            .await
            .unwrap()
            .is_some());

        let again = pipeline.run_once().await;
        assert!(again.is_success());
        let export = again
            .stages
            .iter()
            .find(|s| s.stage == "export" && s.scope == "department")
            .unwrap();
        assert_eq!(export.summary.as_ref().unwrap()["published"], json!([]));
    }

    #[tokio::test]
    async fn source_outage_is_reported_not_fatal() {
        let storage = Arc::new(MemoryBackend::new());
        let source = Arc::new(MemoryEventSource::new("encounters"));
        source.fail_next(100);
        let pipeline = Pipeline::new(storage, PipelineConfig {
            source_backoff_base: std::time::Duration::from_millis(1),
            ..PipelineConfig::default()
        })
        .with_source(source);

        let report = pipeline.run_once().await;
        assert!(!report.is_success());
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.stage, "ingest");
        assert!(matches!(
            &failure.status,
            StageStatus::Failed { reason_code, .. } if reason_code == "source_unavailable"
        ));
        assert!(report.stages.iter().any(|s| s.stage == "conform" && s.succeeded()));
    }
}
