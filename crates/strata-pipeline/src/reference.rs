//! Reference dataset loaders.
//!
//! Reference data (patients, payers, organizations) arrives as periodic full
//! extracts: untyped rows of column name/value pairs. The raw ingestor lands
//! a load only when its content fingerprint differs from the last one.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// One reference row: column name to value.
pub type ReferenceRow = BTreeMap<String, String>;

/// Loads full reference datasets by name.
#[async_trait]
pub trait ReferenceLoader: Send + Sync {
    /// Loads every row of `source_name`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::SourceUnavailable` if the dataset cannot be read.
    async fn load(&self, source_name: &str) -> Result<Vec<ReferenceRow>>;
}

/// SHA-256 fingerprint of a load, independent of row order.
#[must_use]
pub fn fingerprint(rows: &[ReferenceRow]) -> String {
    let mut encoded: Vec<String> = rows
        .iter()
        .map(|row| serde_json::to_string(row).unwrap_or_default())
        .collect();
    encoded.sort_unstable();

    let mut hasher = Sha256::new();
    for row in &encoded {
        hasher.update(row.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// In-memory datasets.
#[derive(Debug, Clone, Default)]
pub struct MemoryReferenceLoader {
    datasets: Arc<RwLock<HashMap<String, Vec<ReferenceRow>>>>,
}

impl MemoryReferenceLoader {
    /// Creates a loader with no datasets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents of a dataset.
    pub fn set(&self, source_name: impl Into<String>, rows: Vec<ReferenceRow>) {
        if let Ok(mut datasets) = self.datasets.write() {
            datasets.insert(source_name.into(), rows);
        }
    }
}

#[async_trait]
impl ReferenceLoader for MemoryReferenceLoader {
    async fn load(&self, source_name: &str) -> Result<Vec<ReferenceRow>> {
        let datasets = self.datasets.read().map_err(|_| unavailable(source_name, "lock poisoned"))?;
        datasets
            .get(source_name)
            .cloned()
            .ok_or_else(|| unavailable(source_name, "no such dataset"))
    }
}

/// Datasets stored as `{dir}/{source}.json` (array of objects) or
/// `{dir}/{source}.jsonl` (one object per line).
///
/// Scalar values are stringified; nulls are dropped.
#[derive(Debug, Clone)]
pub struct JsonFileReferenceLoader {
    dir: PathBuf,
}

impl JsonFileReferenceLoader {
    /// Creates a loader over a directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ReferenceLoader for JsonFileReferenceLoader {
    async fn load(&self, source_name: &str) -> Result<Vec<ReferenceRow>> {
        let array_path = self.dir.join(format!("{source_name}.json"));
        let lines_path = self.dir.join(format!("{source_name}.jsonl"));

        let values: Vec<Value> = if let Ok(contents) = tokio::fs::read_to_string(&array_path).await {
            serde_json::from_str(&contents)
                .map_err(|e| unavailable(source_name, &format!("{}: {e}", array_path.display())))?
        } else {
            let contents = tokio::fs::read_to_string(&lines_path).await.map_err(|e| {
                unavailable(source_name, &format!("{}: {e}", lines_path.display()))
            })?;
            contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str::<Value>)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| unavailable(source_name, &format!("{}: {e}", lines_path.display())))?
        };

        values
            .into_iter()
            .map(|value| to_row(source_name, value))
            .collect()
    }
}

fn to_row(source_name: &str, value: Value) -> Result<ReferenceRow> {
    let Value::Object(map) = value else {
        return Err(unavailable(source_name, "reference rows must be JSON objects"));
    };
    Ok(map
        .into_iter()
        .filter_map(|(column, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((column, s)),
            other => Some((column, other.to_string())),
        })
        .collect())
}

fn unavailable(source_name: &str, message: &str) -> PipelineError {
    PipelineError::SourceUnavailable {
        source_id: source_name.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> ReferenceRow {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn fingerprint_ignores_row_order() {
        let a = row(&[("Id", "Y1"), ("NAME", "Aetna")]);
        let b = row(&[("Id", "Y2"), ("NAME", "Cigna")]);
        assert_eq!(
            fingerprint(&[a.clone(), b.clone()]),
            fingerprint(&[b.clone(), a.clone()])
        );
        assert_ne!(fingerprint(&[a.clone()]), fingerprint(&[a, b]));
    }

    #[tokio::test]
    async fn memory_loader_returns_dataset() {
        let loader = MemoryReferenceLoader::new();
        loader.set("payers", vec![row(&[("Id", "Y1")])]);
        assert_eq!(loader.load("payers").await.unwrap().len(), 1);
        assert!(loader.load("patients").await.is_err());
    }

    #[tokio::test]
    async fn file_loader_reads_array_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("payers.json"),
            r#"[{"Id": "Y1", "NAME": "Aetna", "REVENUE": 12.5, "NOTE": null}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("organizations.jsonl"),
            "{\"Id\": \"O1\", \"NAME\": \"General\"}\n\n{\"Id\": \"O2\"}\n",
        )
        .unwrap();
        let loader = JsonFileReferenceLoader::new(dir.path());

        let payers = loader.load("payers").await.unwrap();
        assert_eq!(payers, vec![row(&[("Id", "Y1"), ("NAME", "Aetna"), ("REVENUE", "12.5")])]);

        let orgs = loader.load("organizations").await.unwrap();
        assert_eq!(orgs.len(), 2);

        let err = loader.load("patients").await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }
}
