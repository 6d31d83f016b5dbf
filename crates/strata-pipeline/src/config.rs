//! Pipeline configuration.
//!
//! Defaults suit a local run against a filesystem root. Every field can be
//! overridden from `STRATA_*` environment variables via
//! [`PipelineConfig::from_env`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use strata_core::error::{Error, Result};
use strata_core::observability::LogFormat;

use crate::entity::EntityType;

/// Runtime configuration shared by every stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory for the local filesystem backend.
    pub storage_root: PathBuf,
    /// Maximum records pulled from a source per ingest run.
    pub ingest_batch_size: usize,
    /// How far behind the watermark late records are still reconciled.
    pub grace_window: Duration,
    /// Allowed lead of a record timestamp over its ingestion time.
    pub clock_skew_tolerance: Duration,
    /// Largest plausible patient age in years.
    pub max_plausible_age: u32,
    /// Payload field holding the event time, when sources provide one.
    pub event_time_field: String,
    /// Raw source feeding each entity type.
    pub entity_sources: BTreeMap<EntityType, String>,
    /// Lease TTL for single-writer sections.
    pub lease_ttl: Duration,
    /// Lease acquisition attempts before giving up.
    pub lease_max_retries: u32,
    /// Pull attempts on `SourceUnavailable` before failing the run.
    pub source_retry_attempts: u32,
    /// Base delay of the source retry backoff.
    pub source_backoff_base: Duration,
    /// Swap attempts per export partition on `ExportRaceCondition`.
    pub export_retry_limit: u32,
    /// Marts aggregated concurrently by `aggregate_all`.
    pub aggregation_parallelism: usize,
    /// Log output format for binaries.
    pub log_format: LogFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let entity_sources = EntityType::ALL
            .iter()
            .map(|e| (*e, e.default_source().to_string()))
            .collect();
        Self {
            storage_root: PathBuf::from("./strata-data"),
            ingest_batch_size: 1_000,
            grace_window: Duration::from_secs(2 * 60 * 60),
            clock_skew_tolerance: Duration::from_secs(5 * 60),
            max_plausible_age: 120,
            event_time_field: "event_time".to_string(),
            entity_sources,
            lease_ttl: strata_core::DEFAULT_LEASE_TTL,
            lease_max_retries: strata_core::DEFAULT_MAX_RETRIES,
            source_retry_attempts: 3,
            source_backoff_base: Duration::from_millis(100),
            export_retry_limit: 3,
            aggregation_parallelism: 4,
            log_format: LogFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from environment variables over the defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `STRATA_STORAGE_ROOT` | `storage_root` |
    /// | `STRATA_INGEST_BATCH_SIZE` | `ingest_batch_size` |
    /// | `STRATA_GRACE_WINDOW_SECS` | `grace_window` |
    /// | `STRATA_CLOCK_SKEW_SECS` | `clock_skew_tolerance` |
    /// | `STRATA_MAX_PLAUSIBLE_AGE` | `max_plausible_age` |
    /// | `STRATA_EVENT_TIME_FIELD` | `event_time_field` |
    /// | `STRATA_SOURCE_<ENTITY>` | `entity_sources` |
    /// | `STRATA_LEASE_TTL_SECS` | `lease_ttl` |
    /// | `STRATA_LEASE_MAX_RETRIES` | `lease_max_retries` |
    /// | `STRATA_SOURCE_RETRY_ATTEMPTS` | `source_retry_attempts` |
    /// | `STRATA_SOURCE_BACKOFF_MS` | `source_backoff_base` |
    /// | `STRATA_EXPORT_RETRY_LIMIT` | `export_retry_limit` |
    /// | `STRATA_AGGREGATION_PARALLELISM` | `aggregation_parallelism` |
    /// | `STRATA_LOG_FORMAT` | `log_format` |
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a variable is set but unparsable, or
    /// the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(root) = env_string("STRATA_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(size) = env_usize("STRATA_INGEST_BATCH_SIZE")? {
            config.ingest_batch_size = size;
        }
        if let Some(secs) = env_u64("STRATA_GRACE_WINDOW_SECS")? {
            config.grace_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STRATA_CLOCK_SKEW_SECS")? {
            config.clock_skew_tolerance = Duration::from_secs(secs);
        }
        if let Some(age) = env_u32("STRATA_MAX_PLAUSIBLE_AGE")? {
            config.max_plausible_age = age;
        }
        if let Some(field) = env_string("STRATA_EVENT_TIME_FIELD") {
            config.event_time_field = field;
        }
        for entity in EntityType::ALL {
            let name = format!("STRATA_SOURCE_{}", entity.as_str().to_ascii_uppercase());
            if let Some(source) = env_string(&name) {
                config.entity_sources.insert(entity, source);
            }
        }
        if let Some(secs) = env_u64("STRATA_LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_u32("STRATA_LEASE_MAX_RETRIES")? {
            config.lease_max_retries = n;
        }
        if let Some(n) = env_u32("STRATA_SOURCE_RETRY_ATTEMPTS")? {
            config.source_retry_attempts = n;
        }
        if let Some(ms) = env_u64("STRATA_SOURCE_BACKOFF_MS")? {
            config.source_backoff_base = Duration::from_millis(ms);
        }
        if let Some(n) = env_u32("STRATA_EXPORT_RETRY_LIMIT")? {
            config.export_retry_limit = n;
        }
        if let Some(n) = env_usize("STRATA_AGGREGATION_PARALLELISM")? {
            config.aggregation_parallelism = n;
        }
        if let Some(format) = env_string("STRATA_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.ingest_batch_size == 0 {
            return Err(Error::InvalidInput(
                "STRATA_INGEST_BATCH_SIZE must be greater than zero".into(),
            ));
        }
        if self.aggregation_parallelism == 0 {
            return Err(Error::InvalidInput(
                "STRATA_AGGREGATION_PARALLELISM must be greater than zero".into(),
            ));
        }
        if self.export_retry_limit == 0 {
            return Err(Error::InvalidInput(
                "STRATA_EXPORT_RETRY_LIMIT must be greater than zero".into(),
            ));
        }
        for source in self.entity_sources.values() {
            strata_core::storage_keys::validate_name(source)?;
        }
        Ok(())
    }

    /// Returns the raw source feeding an entity type.
    #[must_use]
    pub fn source_for(&self, entity: EntityType) -> &str {
        self.entity_sources
            .get(&entity)
            .map_or_else(|| entity.default_source(), String::as_str)
    }

    /// Grace window as a `chrono` duration.
    #[must_use]
    pub fn grace(&self) -> chrono::Duration {
        to_chrono(self.grace_window)
    }

    /// Clock-skew tolerance as a `chrono` duration.
    #[must_use]
    pub fn skew(&self) -> chrono::Duration {
        to_chrono(self.clock_skew_tolerance)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}
