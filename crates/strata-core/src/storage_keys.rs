//! Typed storage keys for every tier.
//!
//! Each key type corresponds to one storage prefix and the stage that owns
//! it. Stage code builds paths only through these constructors.
//!
//! | Key Type | Prefix | Owner |
//! |----------|--------|-------|
//! | `RawKey` | `raw/` | Raw Ingestor |
//! | `StateKey` | `state/` | progress store (cursors, watermarks, mart progress) |
//! | `ConformedKey` | `conformed/` | Conformance Transformer |
//! | `GoldKey` | `gold/` | Aggregation Engine |
//! | `ExportKey` | `export/` | Export Publisher |
//! | `QuarantineKey` | `quarantine/` | quarantine sink |
//! | `LockKey` | `locks/` | run leases |
//!
//! # Example
//!
//! ```rust
//! use strata_core::partition::PartitionKey;
//! use strata_core::storage_keys::{RawKey, StateKey, StorageKey};
//!
//! let partition: PartitionKey = "date=2025-01-15/hour=05".parse().unwrap();
//! let key = RawKey::batch("encounters", &partition, 0, 99);
//! assert_eq!(
//!     key.path(),
//!     "raw/encounters/date=2025-01-15/hour=05/00000000000000000000-00000000000000000099.jsonl"
//! );
//! assert_eq!(StateKey::cursor("encounters").path(), "state/cursors/encounters.json");
//! ```

use crate::error::{Error, Result};
use crate::partition::PartitionKey;

/// A typed storage key that encodes path structure.
pub trait StorageKey: AsRef<str> {
    /// Returns the underlying path string.
    fn path(&self) -> &str {
        self.as_ref()
    }
}

macro_rules! storage_key {
    ($name:ident) => {
        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl StorageKey for $name {}

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Validates a source, entity type, mart or stage name used as a path segment.
///
/// Names must match `[a-z][a-z0-9_-]*`.
///
/// # Errors
///
/// Returns `Error::InvalidId` for names outside that grammar.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidId {
            message: format!("invalid name '{name}': expected [a-z][a-z0-9_-]*"),
        })
    }
}

// ============================================================================
// RawKey - landing tier batches
// ============================================================================

/// A typed key for landing-tier batch files.
///
/// # Path Format
///
/// `raw/{source}/{partition}/{first_offset:020}-{last_offset:020}.jsonl`
///
/// The name is a pure function of partition and offset range, so a retried
/// batch overwrites its earlier attempt instead of duplicating it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawKey(String);

impl RawKey {
    /// Creates the key for a batch covering `first_offset..=last_offset`.
    #[must_use]
    pub fn batch(source: &str, partition: &PartitionKey, first_offset: u64, last_offset: u64) -> Self {
        Self(format!(
            "raw/{source}/{partition}/{first_offset:020}-{last_offset:020}.jsonl"
        ))
    }

    /// Creates the prefix for all batches of a source.
    #[must_use]
    pub fn source_dir(source: &str) -> Self {
        Self(format!("raw/{source}/"))
    }

    /// Parses a batch path back into `(partition, first_offset, last_offset)`.
    #[must_use]
    pub fn parse_batch(source: &str, path: &str) -> Option<(PartitionKey, u64, u64)> {
        let rest = path.strip_prefix(&format!("raw/{source}/"))?;
        let (partition, file) = rest.rsplit_once('/')?;
        let (first, last) = file.strip_suffix(".jsonl")?.split_once('-')?;
        Some((
            PartitionKey::parse(partition).ok()?,
            first.parse().ok()?,
            last.parse().ok()?,
        ))
    }
}

storage_key!(RawKey);

// ============================================================================
// StateKey - progress markers
// ============================================================================

/// A typed key for durable progress records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey(String);

impl StateKey {
    /// Cursor record for a source: `state/cursors/{source}.json`.
    #[must_use]
    pub fn cursor(source: &str) -> Self {
        Self(format!("state/cursors/{source}.json"))
    }

    /// Watermark record for an entity type: `state/watermarks/{entity}.json`.
    #[must_use]
    pub fn watermark(entity_type: &str) -> Self {
        Self(format!("state/watermarks/{entity_type}.json"))
    }

    /// Progress record for a mart: `state/marts/{mart}.json`.
    #[must_use]
    pub fn mart_progress(mart: &str) -> Self {
        Self(format!("state/marts/{mart}.json"))
    }

    /// Prefix of all cursor records.
    #[must_use]
    pub fn cursors_dir() -> Self {
        Self("state/cursors/".to_string())
    }
}

storage_key!(StateKey);

// ============================================================================
// ConformedKey - conformed tier
// ============================================================================

/// A typed key for conformed-tier manifests and partition snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConformedKey(String);

impl ConformedKey {
    /// Manifest for an entity type: `conformed/{entity}/manifest.json`.
    #[must_use]
    pub fn manifest(entity_type: &str) -> Self {
        Self(format!("conformed/{entity_type}/manifest.json"))
    }

    /// Immutable partition snapshot written at a manifest version.
    #[must_use]
    pub fn snapshot(entity_type: &str, partition: &PartitionKey, version: u64) -> Self {
        Self(format!(
            "conformed/{entity_type}/{partition}/v{version:010}.json"
        ))
    }

    /// Prefix of every object for an entity type.
    #[must_use]
    pub fn entity_dir(entity_type: &str) -> Self {
        Self(format!("conformed/{entity_type}/"))
    }
}

storage_key!(ConformedKey);

// ============================================================================
// GoldKey - aggregated marts
// ============================================================================

/// A typed key for mart manifests and partition files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GoldKey(String);

impl GoldKey {
    /// Manifest for a mart: `gold/{mart}/manifest.json`.
    #[must_use]
    pub fn manifest(mart: &str) -> Self {
        Self(format!("gold/{mart}/manifest.json"))
    }

    /// Content-addressed partition file.
    #[must_use]
    pub fn partition_file(mart: &str, partition: &PartitionKey, content_hash: &str) -> Self {
        let short = content_hash.get(..16).unwrap_or(content_hash);
        Self(format!("gold/{mart}/{partition}/part-{short}.parquet"))
    }
}

storage_key!(GoldKey);

// ============================================================================
// ExportKey - consumer-facing export location
// ============================================================================

/// A typed key for the externally readable export layout.
///
/// # Path Format
///
/// - Published: `export/{mart}/{partition}/data.parquet`
/// - Staging: `export/_staging/{mart}/{partition}/{ulid}.parquet`
/// - Publication record: `export/{mart}/_published.json`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportKey(String);

impl ExportKey {
    /// Published file for a mart partition.
    #[must_use]
    pub fn partition_file(mart: &str, partition: &PartitionKey) -> Self {
        Self(format!("export/{mart}/{partition}/data.parquet"))
    }

    /// Staging location for a new version of a partition.
    #[must_use]
    pub fn staging(mart: &str, partition: &PartitionKey, staging_id: &str) -> Self {
        Self(format!(
            "export/_staging/{mart}/{partition}/{staging_id}.parquet"
        ))
    }

    /// Publication record listing exported partitions and their content hashes.
    #[must_use]
    pub fn published(mart: &str) -> Self {
        Self(format!("export/{mart}/_published.json"))
    }
}

storage_key!(ExportKey);

// ============================================================================
// QuarantineKey - rejected records
// ============================================================================

/// A typed key for quarantined records.
///
/// # Path Format
///
/// `quarantine/{stage}/{scope}/{record_hash}.json`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuarantineKey(String);

impl QuarantineKey {
    /// Key for a single quarantined record.
    #[must_use]
    pub fn record(stage: &str, scope: &str, record_hash: &str) -> Self {
        Self(format!("quarantine/{stage}/{scope}/{record_hash}.json"))
    }

    /// Prefix for a stage, optionally narrowed to one scope.
    #[must_use]
    pub fn dir(stage: &str, scope: Option<&str>) -> Self {
        match scope {
            Some(scope) => Self(format!("quarantine/{stage}/{scope}/")),
            None => Self(format!("quarantine/{stage}/")),
        }
    }
}

storage_key!(QuarantineKey);

// ============================================================================
// LockKey - run leases
// ============================================================================

/// A typed key for run lease files: `locks/{scope}/{name}.lock.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Lease for one single-writer resource.
    #[must_use]
    pub fn lease(scope: &str, name: &str) -> Self {
        Self(format!("locks/{scope}/{name}.lock.json"))
    }
}

storage_key!(LockKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_batch_roundtrip() {
        let partition: PartitionKey = "date=2025-02-01/hour=13".parse().unwrap();
        let key = RawKey::batch("encounters", &partition, 100, 149);
        let parsed = RawKey::parse_batch("encounters", key.path()).expect("parse");
        assert_eq!(parsed, (partition, 100, 149));
    }

    #[test]
    fn raw_batch_parse_rejects_other_sources() {
        let partition: PartitionKey = "date=2025-02-01/hour=13".parse().unwrap();
        let key = RawKey::batch("encounters", &partition, 0, 1);
        assert!(RawKey::parse_batch("patients", key.path()).is_none());
    }

    #[test]
    fn raw_batch_names_sort_by_offset() {
        let partition: PartitionKey = "date=2025-02-01/hour=13".parse().unwrap();
        let a = RawKey::batch("s", &partition, 9, 10);
        let b = RawKey::batch("s", &partition, 10, 20);
        assert!(a.path() < b.path());
    }

    #[test]
    fn gold_partition_file_uses_short_hash() {
        let partition: PartitionKey = "month=2025-01".parse().unwrap();
        let key = GoldKey::partition_file("department", &partition, "0123456789abcdef0123");
        assert_eq!(
            key.path(),
            "gold/department/month=2025-01/part-0123456789abcdef.parquet"
        );
    }

    #[test]
    fn export_layout_is_partition_prunable() {
        let partition: PartitionKey = "month=2025-01".parse().unwrap();
        assert_eq!(
            ExportKey::partition_file("payer", &partition).path(),
            "export/payer/month=2025-01/data.parquet"
        );
        assert!(ExportKey::staging("payer", &partition, "01J")
            .path()
            .starts_with("export/_staging/payer/"));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("encounters").is_ok());
        assert!(validate_name("organization_month").is_ok());
        assert!(validate_name("Encounters").is_err());
        assert!(validate_name("../x").is_err());
        assert!(validate_name("").is_err());
    }
}
