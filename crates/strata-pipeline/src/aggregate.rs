//! Aggregation engine: recompute-and-replace mart partitions.
//!
//! A mart partition is rebuilt from the full current state of the matching
//! conformed encounter partition, never updated incrementally. Which
//! partitions need rebuilding is decided by comparing conformed partition
//! versions with those recorded in the mart's progress record; a change to a
//! joined dimension marks every partition.
//!
//! Partition files are content-addressed
//! (`gold/{mart}/{partition}/part-{hash16}.parquet`) and become visible
//! through a CAS swap of `gold/{mart}/manifest.json`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use strata_core::partition::PartitionKey;
use strata_core::storage::{StorageBackend, WritePrecondition};
use strata_core::storage_keys::{GoldKey, StorageKey};
use strata_core::{LeaseGuard, RunId};

use crate::config::PipelineConfig;
use crate::conformed::{parse_partition, ConformedEntity, ConformedManifest, ConformedStore};
use crate::entity::EntityType;
use crate::error::{PipelineError, Result};
use crate::lease;
use crate::mart::{AggregateRow, Mart};
use crate::metrics;
use crate::parquet_util;
use crate::progress::{ensure_fresh, ProgressRecord, ProgressStore, Versioned};

/// Group key used when an encounter lacks the grouping attribute.
pub const UNKNOWN_GROUP: &str = "unknown";

/// Manifest entry for one mart partition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MartPartition {
    /// File path.
    pub path: String,
    /// Hex SHA-256 of the file bytes.
    pub content_hash: String,
    /// Rows in the file.
    pub row_count: u64,
}

/// Commit point of a mart's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MartManifest {
    /// Mart name.
    pub mart: Option<Mart>,
    /// Incremented on every commit.
    pub version: u64,
    /// Partition path form to current file.
    #[serde(default)]
    pub partitions: BTreeMap<String, MartPartition>,
    /// Fencing token of the last writer.
    #[serde(default)]
    pub fencing_token: u64,
    /// Last commit time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressRecord for MartManifest {
    fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

/// Outcome of one aggregation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Mart built.
    pub mart: Mart,
    /// Rows in the partitions written.
    pub rows_written: u64,
    /// Partitions whose file changed.
    pub partitions_written: Vec<PartitionKey>,
    /// Partitions rebuilt to identical content.
    pub partitions_unchanged: Vec<PartitionKey>,
    /// Partitions removed because no encounters remain.
    pub partitions_removed: Vec<PartitionKey>,
    /// Mart manifest version after the run.
    pub manifest_version: u64,
}

impl AggregateResult {
    fn empty(mart: Mart, manifest_version: u64) -> Self {
        Self {
            mart,
            rows_written: 0,
            partitions_written: Vec::new(),
            partitions_unchanged: Vec::new(),
            partitions_removed: Vec::new(),
            manifest_version,
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    encounters: i64,
    patients: BTreeSet<String>,
    claim: f64,
    coverage: f64,
    stay_hours: f64,
    stays: u32,
}

/// Computes a mart partition's rows from its encounters.
///
/// Rows are sorted by grouping key; measures are summed in natural-key
/// order, so the output is a pure function of the input set.
#[must_use]
pub fn compute_rows(
    mart: Mart,
    month: &str,
    encounters: &[ConformedEntity],
    names: &HashMap<String, String>,
) -> Vec<AggregateRow> {
    let mut sorted: Vec<&ConformedEntity> = encounters.iter().collect();
    sorted.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));

    let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
    for entity in sorted {
        let Some(encounter) = entity.attributes.as_encounter() else {
            continue;
        };
        let key = match mart {
            Mart::Department => encounter.department.clone(),
            Mart::OrganizationMonth => encounter.organization_id.clone(),
            Mart::Payer => encounter.payer_id.clone(),
        }
        .unwrap_or_else(|| UNKNOWN_GROUP.to_string());

        let acc = groups.entry(key).or_default();
        acc.encounters += 1;
        if let Some(patient) = &encounter.patient_id {
            acc.patients.insert(patient.clone());
        }
        acc.claim += encounter.total_claim_cost.unwrap_or(0.0);
        acc.coverage += encounter.payer_coverage.unwrap_or(0.0);
        if let (Some(admitted), Some(discharged)) = (encounter.admission_time, encounter.discharge_time) {
            #[allow(clippy::cast_precision_loss)]
            let hours = (discharged - admitted).num_seconds() as f64 / 3600.0;
            acc.stay_hours += hours;
            acc.stays += 1;
        }
    }

    groups
        .into_iter()
        .map(|(key, acc)| {
            let derived = match mart {
                Mart::Department => None,
                Mart::OrganizationMonth => {
                    (acc.stays > 0).then(|| acc.stay_hours / f64::from(acc.stays))
                }
                Mart::Payer => (acc.claim > 0.0).then(|| acc.coverage / acc.claim),
            };
            AggregateRow {
                month: month.to_string(),
                name: mart.name_column().and_then(|_| names.get(&key).cloned()),
                key,
                encounter_count: acc.encounters,
                distinct_patients: i64::try_from(acc.patients.len()).unwrap_or(i64::MAX),
                total_claim_cost: acc.claim,
                total_payer_coverage: acc.coverage,
                derived,
            }
        })
        .collect()
}

fn hash_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Builds marts from the conformed tier.
#[derive(Debug)]
pub struct AggregationEngine<S> {
    storage: Arc<S>,
    config: PipelineConfig,
    conformed: ConformedStore<S>,
    progress: ProgressStore<S>,
}

impl<S: StorageBackend> AggregationEngine<S> {
    /// Creates an engine.
    #[must_use]
    pub fn new(storage: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            conformed: ConformedStore::new(Arc::clone(&storage)),
            progress: ProgressStore::new(Arc::clone(&storage)),
            storage,
            config,
        }
    }

    /// Loads a mart's manifest (empty if never built).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn manifest(&self, mart: Mart) -> Result<Versioned<MartManifest>> {
        let (mut record, version) = match self
            .progress
            .load::<MartManifest>(GoldKey::manifest(mart.as_str()).path())
            .await?
        {
            Some((record, version)) => (record, Some(version)),
            None => (MartManifest::default(), None),
        };
        record.mart = Some(mart);
        Ok(Versioned { record, version })
    }

    /// Reads the rows of one mart partition.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or an invalid file.
    pub async fn read_partition(&self, mart: Mart, entry: &MartPartition) -> Result<Vec<AggregateRow>> {
        let bytes = self.storage.get(&entry.path).await?;
        parquet_util::read_mart(mart, &bytes)
    }

    /// Partitions whose conformed inputs changed since the mart was built.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn affected_partitions(&self, mart: Mart) -> Result<Vec<PartitionKey>> {
        let progress = self.progress.load_mart_progress(mart.as_str()).await?.record;
        let encounters = self.conformed.manifest(EntityType::Encounter).await?.record;
        let seen = progress.source_versions.get(&EntityType::Encounter);

        let dimension_changed = match mart.dimension() {
            Some(dimension) => {
                let current = partition_versions(&self.conformed.manifest(dimension).await?.record);
                progress.source_versions.get(&dimension).cloned().unwrap_or_default() != current
            }
            None => false,
        };

        let mut affected = BTreeSet::new();
        for (partition, entry) in &encounters.partitions {
            let built = seen.and_then(|s| s.get(partition)).copied();
            if dimension_changed || built != Some(entry.version) {
                affected.insert(partition.clone());
            }
        }
        if let Some(seen) = seen {
            affected.extend(
                seen.keys()
                    .filter(|p| !encounters.partitions.contains_key(*p))
                    .cloned(),
            );
        }
        affected.iter().map(|p| parse_partition(p)).collect()
    }

    /// Rebuilds `affected` partitions of a mart and swaps them in.
    ///
    /// # Errors
    ///
    /// - `LeaseBusy` if another run is building this mart.
    /// - `PartialWriteFailure` if a partition file could not be written; the
    ///   manifest and progress record are unchanged.
    /// - `MergeConflict` if the manifest changed concurrently.
    #[tracing::instrument(skip(self, affected), fields(mart = %mart, partitions = affected.len()))]
    pub async fn aggregate(&self, mart: Mart, affected: &[PartitionKey]) -> Result<AggregateResult> {
        let run_id = RunId::generate();
        let started = std::time::Instant::now();

        let guard = lease::acquire(&self.storage, "aggregate", mart.as_str(), &self.config, run_id).await?;
        let result = self.aggregate_locked(&guard, mart, affected).await;
        lease::release(guard, "aggregate", mart.as_str()).await;

        metrics::record_stage_outcome("aggregate", started, &result);
        result
    }

    /// Builds every mart's affected partitions, isolating failures per mart.
    pub async fn aggregate_all(&self) -> Vec<(Mart, Result<AggregateResult>)> {
        let mut results: Vec<(Mart, Result<AggregateResult>)> = stream::iter(Mart::ALL)
            .map(|mart| async move {
                let result = match self.affected_partitions(mart).await {
                    Ok(affected) => self.aggregate(mart, &affected).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    tracing::error!(mart = %mart, error = %e, "mart build failed");
                }
                (mart, result)
            })
            .buffer_unordered(self.config.aggregation_parallelism.max(1))
            .collect()
            .await;
        results.sort_by_key(|(mart, _)| *mart);
        results
    }

    async fn aggregate_locked(
        &self,
        guard: &LeaseGuard<S>,
        mart: Mart,
        affected: &[PartitionKey],
    ) -> Result<AggregateResult> {
        let token = guard.fencing_token();
        let manifest = self.manifest(mart).await?;
        ensure_fresh(GoldKey::manifest(mart.as_str()).path(), manifest.record.fencing_token, token)?;
        if affected.is_empty() {
            return Ok(AggregateResult::empty(mart, manifest.record.version));
        }

        let encounters = self.conformed.manifest(EntityType::Encounter).await?.record;
        let dimension = match mart.dimension() {
            Some(dimension) => Some(self.conformed.manifest(dimension).await?.record),
            None => None,
        };
        let names = match &dimension {
            Some(dimension) => self.dimension_names(dimension).await?,
            None => HashMap::new(),
        };

        let mut next = manifest.record.clone();
        let mut result = AggregateResult::empty(mart, manifest.record.version);
        let mut superseded = Vec::new();
        let affected_names: Vec<String> = affected.iter().map(ToString::to_string).collect();

        for partition in affected {
            let name = partition.to_string();
            let rows = match encounters.partitions.get(&name) {
                Some(entry) => {
                    let entities = self.conformed.read_partition(entry).await?;
                    compute_rows(mart, partition.get("month").unwrap_or(name.as_str()), &entities, &names)
                }
                None => Vec::new(),
            };

            if rows.is_empty() {
                if let Some(old) = next.partitions.remove(&name) {
                    superseded.push(old.path);
                    result.partitions_removed.push(partition.clone());
                }
                continue;
            }

            let bytes = parquet_util::write_mart(mart, &rows)?;
            let content_hash = hash_hex(&bytes);
            if next.partitions.get(&name).is_some_and(|p| p.content_hash == content_hash) {
                result.partitions_unchanged.push(partition.clone());
                continue;
            }

            let path = self
                .write_file(mart, partition, &content_hash, bytes, &affected_names)
                .await?;
            if let Some(old) = next.partitions.insert(
                name,
                MartPartition {
                    path,
                    content_hash,
                    row_count: rows.len() as u64,
                },
            ) {
                superseded.push(old.path);
            }
            result.rows_written += rows.len() as u64;
            result.partitions_written.push(partition.clone());
        }

        if !result.partitions_written.is_empty() || !result.partitions_removed.is_empty() {
            lease::ensure_held(guard, "aggregate", mart.as_str()).await?;
            next.mart = Some(mart);
            next.version += 1;
            next.fencing_token = token.sequence();
            next.updated_at = Some(Utc::now());
            self.progress
                .commit(GoldKey::manifest(mart.as_str()).path(), &next, manifest.version)
                .await?;
            result.manifest_version = next.version;

            for path in superseded {
                if let Err(e) = self.storage.delete(&path).await {
                    tracing::warn!(path = %path, error = %e, "failed to delete superseded mart file");
                }
            }
        }

        self.record_progress(guard, mart, affected, &encounters, dimension.as_ref())
            .await?;

        metrics::record_mart_rows(mart.as_str(), result.rows_written);
        tracing::info!(
            mart = %mart,
            rows = result.rows_written,
            written = result.partitions_written.len(),
            unchanged = result.partitions_unchanged.len(),
            removed = result.partitions_removed.len(),
            "mart partitions replaced"
        );
        Ok(result)
    }

    async fn write_file(
        &self,
        mart: Mart,
        partition: &PartitionKey,
        content_hash: &str,
        bytes: Bytes,
        affected: &[String],
    ) -> Result<String> {
        let key = GoldKey::partition_file(mart.as_str(), partition, content_hash);
        self.storage
            .put(key.path(), bytes, WritePrecondition::None)
            .await
            .map_err(|e| PipelineError::PartialWriteFailure {
                scope: format!("aggregate/{mart}"),
                affected_partitions: affected.to_vec(),
                message: format!("write {key}: {e}"),
            })?;
        Ok(key.path().to_string())
    }

    async fn dimension_names(&self, dimension: &ConformedManifest) -> Result<HashMap<String, String>> {
        Ok(self
            .conformed
            .read_all(dimension)
            .await?
            .into_values()
            .flatten()
            .filter_map(|e| {
                let name = e.attributes.display_name()?.to_string();
                Some((e.natural_key, name))
            })
            .collect())
    }

    /// Records the conformed versions the rebuilt partitions reflect.
    async fn record_progress(
        &self,
        guard: &LeaseGuard<S>,
        mart: Mart,
        affected: &[PartitionKey],
        encounters: &ConformedManifest,
        dimension: Option<&ConformedManifest>,
    ) -> Result<()> {
        let mut progress = self.progress.load_mart_progress(mart.as_str()).await?;
        let before = progress.record.clone();
        let seen = progress
            .record
            .source_versions
            .entry(EntityType::Encounter)
            .or_default();
        let rebuilt: BTreeSet<String> = affected.iter().map(ToString::to_string).collect();
        for partition in &rebuilt {
            match encounters.partitions.get(partition) {
                Some(entry) => {
                    seen.insert(partition.clone(), entry.version);
                }
                None => {
                    seen.remove(partition);
                }
            }
        }

        // Dimension versions only count once every partition saw them.
        if let (Some(dimension), Some(manifest)) = (mart.dimension(), dimension) {
            if encounters.partitions.keys().all(|p| rebuilt.contains(p)) {
                progress
                    .record
                    .source_versions
                    .insert(dimension, partition_versions(manifest));
            }
        }

        if progress.record == before {
            return Ok(());
        }
        progress.record.fencing_token = guard.fencing_token().sequence();
        progress.record.updated_at = Some(Utc::now());
        self.progress
            .commit_mart_progress(&progress.record, progress.version)
            .await?;
        Ok(())
    }
}

fn partition_versions(manifest: &ConformedManifest) -> BTreeMap<String, u64> {
    manifest
        .partitions
        .iter()
        .map(|(p, entry)| (p.clone(), entry.version))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EncounterAttributes, EntityRecord};
    use chrono::TimeZone;

    fn encounter(key: &str, patient: &str, department: Option<&str>, claim: f64) -> ConformedEntity {
        let t = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        ConformedEntity {
            natural_key: key.into(),
            attributes: EntityRecord::Encounter(EncounterAttributes {
                patient_id: Some(patient.into()),
                department: department.map(Into::into),
                payer_id: Some("Y1".into()),
                admission_time: Some(t),
                discharge_time: Some(t + chrono::Duration::hours(6)),
                total_claim_cost: Some(claim),
                payer_coverage: Some(claim / 2.0),
                ..EncounterAttributes::default()
            }),
            valid_from: t,
            ingested_at: t,
            source_offset: 0,
            source_watermark: None,
        }
    }

    #[test]
    fn department_rows_group_and_count_distinct_patients() {
        let rows = compute_rows(
            Mart::Department,
            "2025-01",
            &[
                encounter("E2", "P1", Some("Cardiology"), 100.0),
                encounter("E1", "P1", Some("Cardiology"), 50.0),
                encounter("E3", "P2", None, 10.0),
            ],
            &HashMap::new(),
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "Cardiology");
        assert_eq!(rows[0].encounter_count, 2);
        assert_eq!(rows[0].distinct_patients, 1);
        assert!((rows[0].total_claim_cost - 150.0).abs() < f64::EPSILON);
        assert_eq!(rows[1].key, UNKNOWN_GROUP);
    }

    #[test]
    fn payer_rows_join_names_and_ratio() {
        let names = HashMap::from([("Y1".to_string(), "Aetna".to_string())]);
        let rows = compute_rows(
            Mart::Payer,
            "2025-01",
            &[encounter("E1", "P1", None, 100.0)],
            &names,
        );
        assert_eq!(rows[0].name.as_deref(), Some("Aetna"));
        assert_eq!(rows[0].derived, Some(0.5));
    }

    #[test]
    fn organization_rows_average_length_of_stay() {
        let rows = compute_rows(
            Mart::OrganizationMonth,
            "2025-01",
            &[encounter("E1", "P1", None, 1.0), encounter("E2", "P2", None, 1.0)],
            &HashMap::new(),
        );
        assert_eq!(rows[0].key, UNKNOWN_GROUP);
        assert_eq!(rows[0].derived, Some(6.0));
        assert_eq!(rows[0].name, None);
    }

    #[test]
    fn input_order_does_not_change_rows() {
        let a = encounter("E1", "P1", Some("ICU"), 0.1);
        let b = encounter("E2", "P2", Some("ICU"), 0.2);
        let c = encounter("E3", "P3", Some("ICU"), 0.3);
        let forward = compute_rows(Mart::Department, "2025-01", &[a.clone(), b.clone(), c.clone()], &HashMap::new());
        let backward = compute_rows(Mart::Department, "2025-01", &[c, b, a], &HashMap::new());
        assert_eq!(forward, backward);
    }
}
