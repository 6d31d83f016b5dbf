//! Storage backend abstraction for the tiered pipeline.
//!
//! Every tier (landing, conformed, gold, export) and every progress record
//! lives behind this contract:
//! - Conditional writes with preconditions (CAS on an opaque version token)
//! - Object metadata including `last_modified`
//! - Atomic replace via `rename`, used to swap staged export files into place
//!
//! Version tokens are opaque strings so that object stores (generation
//! numbers, `ETag`s) and the local filesystem can share one contract.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

impl WritePrecondition {
    /// Builds the precondition that pins a previously observed version.
    ///
    /// `None` (object absent at read time) maps to [`WritePrecondition::DoesNotExist`].
    #[must_use]
    pub fn from_observed(version: Option<String>) -> Self {
        version.map_or(Self::DoesNotExist, Self::MatchesVersion)
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
///
/// All storage backends (local filesystem, memory) implement this trait.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: Results are returned in arbitrary order. Callers requiring
    /// deterministic order should sort by `path`.
    ///
    /// **Versions**: a backend may report advisory versions here; CAS callers
    /// take their token from `head`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Atomically replaces `to` with the contents of `from`, then removes `from`.
    ///
    /// The precondition is evaluated against `to`. Readers of `to` observe
    /// either the previous object or the new one, never a partial write.
    /// Returns `Error::NotFound` if `from` doesn't exist.
    async fn rename(
        &self,
        from: &str,
        to: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;
}

/// In-memory storage backend for tests and single-process runs.
///
/// Thread-safe via `RwLock`. Uses numeric versions internally (stored as
/// strings) to simulate generation-numbered object stores.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

/// Evaluates a precondition against the current object, if any.
fn check_precondition(
    current: Option<&StoredObject>,
    precondition: &WritePrecondition,
) -> Option<WriteResult> {
    match precondition {
        WritePrecondition::DoesNotExist => current.map(|obj| WriteResult::PreconditionFailed {
            current_version: obj.version.to_string(),
        }),
        WritePrecondition::MatchesVersion(expected) => {
            let expected_num: i64 = expected.parse().unwrap_or(-1);
            match current {
                Some(obj) if obj.version != expected_num => Some(WriteResult::PreconditionFailed {
                    current_version: obj.version.to_string(),
                }),
                None => Some(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                }),
                Some(_) => None,
            }
        }
        WritePrecondition::None => None,
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(poisoned)?.len())
    }

    /// Returns true if no objects are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(poisoned)?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(poisoned)?;

        let current = objects.get(path);
        if let Some(failed) = check_precondition(current, &precondition) {
            return Ok(failed);
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(poisoned)?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(poisoned)?;

        let Some(source) = objects.get(from).cloned() else {
            return Err(Error::NotFound(format!("rename source not found: {from}")));
        };
        let current = objects.get(to);
        if let Some(failed) = check_precondition(current, &precondition) {
            return Ok(failed);
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            to.to_string(),
            StoredObject {
                data: source.data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        objects.remove(from);
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("test/file.txt", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend.get("test/file.txt").await.expect("get");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_precondition_does_not_exist() {
        let backend = MemoryBackend::new();

        let result = backend
            .put("new.txt", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(result.is_success());

        let result = backend
            .put("new.txt", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_precondition_matches_version() {
        let backend = MemoryBackend::new();
        let WriteResult::Success { version } = backend
            .put("gen.txt", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let result = backend
            .put(
                "gen.txt",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(version.clone()),
            )
            .await
            .expect("put");
        assert!(result.is_success());

        // Stale version loses.
        let result = backend
            .put(
                "gen.txt",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.get("gen.txt").await.expect("get"), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MemoryBackend::new();
        for path in ["a/1.txt", "a/2.txt", "b/1.txt"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        assert_eq!(backend.list("a/").await.expect("list").len(), 2);
        assert_eq!(backend.list("b/").await.expect("list").len(), 1);
        assert!(backend.list("c/").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put("del.txt", Bytes::from("data"), WritePrecondition::None)
            .await
            .expect("put");

        backend.delete("del.txt").await.expect("delete");
        backend.delete("del.txt").await.expect("second delete");
        assert!(backend.head("del.txt").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn test_rename_replaces_target_atomically() {
        let backend = MemoryBackend::new();
        backend
            .put("out/data", Bytes::from("old"), WritePrecondition::None)
            .await
            .expect("put target");
        backend
            .put("staging/1", Bytes::from("new"), WritePrecondition::None)
            .await
            .expect("put staging");

        let result = backend
            .rename("staging/1", "out/data", WritePrecondition::MatchesVersion("1".into()))
            .await
            .expect("rename");

        assert!(matches!(result, WriteResult::Success { ref version } if version == "2"));
        assert_eq!(backend.get("out/data").await.expect("get"), Bytes::from("new"));
        assert!(backend.head("staging/1").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn test_rename_precondition_failure_keeps_both_objects() {
        let backend = MemoryBackend::new();
        backend
            .put("out/data", Bytes::from("old"), WritePrecondition::None)
            .await
            .expect("put target");
        backend
            .put("staging/1", Bytes::from("new"), WritePrecondition::None)
            .await
            .expect("put staging");

        let result = backend
            .rename("staging/1", "out/data", WritePrecondition::DoesNotExist)
            .await
            .expect("rename");

        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.get("out/data").await.expect("get"), Bytes::from("old"));
        assert!(backend.head("staging/1").await.expect("head").is_some());
    }

    #[tokio::test]
    async fn test_rename_missing_source_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .rename("missing", "out", WritePrecondition::None)
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_precondition_from_observed() {
        assert_eq!(
            WritePrecondition::from_observed(None),
            WritePrecondition::DoesNotExist
        );
        assert_eq!(
            WritePrecondition::from_observed(Some("3".into())),
            WritePrecondition::MatchesVersion("3".into())
        );
    }
}
