//! Local filesystem storage backend.
//!
//! Maps object keys onto files under a root directory. Writes land in a
//! temporary sibling file first and are moved into place with a rename, so a
//! reader never observes a half-written object.
//!
//! Version tokens are the first 16 hex characters of the SHA-256 of the file
//! contents. Conditional writes are serialized through an in-process mutex;
//! cross-process exclusion relies on the run leases in [`crate::lock`].
//!
//! `list` only stats files. Its version tokens are built from size and
//! modification time and are advisory; use `head` for a CAS token.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const TEMP_MARKER: &str = ".tmp-";

/// Storage backend rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
    cas: Arc<Mutex<()>>,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::storage_with_source(format!("create root {}", root.display()), e)
        })?;
        Ok(Self {
            root,
            cas: Arc::new(Mutex::new(())),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("read {}", path.display()),
                e,
            )),
        }
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::storage_with_source(format!("create dir {}", parent.display()), e)
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!("{file_name}{TEMP_MARKER}{}", Ulid::new()));
        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {}", temp.display()), e))?;
        tokio::fs::rename(&temp, path).await.map_err(|e| {
            Error::storage_with_source(format!("rename into {}", path.display()), e)
        })
    }

    async fn meta_for(&self, path: &Path, key: String) -> Result<Option<ObjectMeta>> {
        let Some(bytes) = self.read_optional(path).await? else {
            return Ok(None);
        };
        let last_modified = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(Some(ObjectMeta {
            path: key,
            size: bytes.len() as u64,
            version: content_version(&bytes),
            last_modified,
        }))
    }
}

/// Listing entry from file metadata alone; the contents are not read.
async fn stat_meta(path: &Path, key: String) -> Result<Option<ObjectMeta>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::storage_with_source(
                format!("stat {}", path.display()),
                e,
            ))
        }
    };
    let modified = metadata.modified().ok();
    let nanos = modified
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    Ok(Some(ObjectMeta {
        path: key,
        size: metadata.len(),
        version: format!("{:x}-{nanos:x}", metadata.len()),
        last_modified: modified.map(DateTime::<Utc>::from),
    }))
}

/// Version token derived from file contents.
fn content_version(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

fn evaluate(current: Option<&[u8]>, precondition: &WritePrecondition) -> Option<WriteResult> {
    match (precondition, current) {
        (WritePrecondition::DoesNotExist, Some(bytes)) => Some(WriteResult::PreconditionFailed {
            current_version: content_version(bytes),
        }),
        (WritePrecondition::MatchesVersion(_), None) => Some(WriteResult::PreconditionFailed {
            current_version: "0".to_string(),
        }),
        (WritePrecondition::MatchesVersion(expected), Some(bytes)) => {
            let actual = content_version(bytes);
            (actual != *expected).then_some(WriteResult::PreconditionFailed {
                current_version: actual,
            })
        }
        _ => None,
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        self.read_optional(&file)
            .await?
            .map(Bytes::from)
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let file = self.resolve(path)?;
        let _cas = self.cas.lock().await;

        if precondition != WritePrecondition::None {
            let current = self.read_optional(&file).await?;
            if let Some(failed) = evaluate(current.as_deref(), &precondition) {
                return Ok(failed);
            }
        }

        self.write_atomic(&file, &data).await?;
        Ok(WriteResult::Success {
            version: content_version(&data),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("delete {}", file.display()),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let start = match prefix.rfind('/') {
            Some(idx) => self.resolve(&prefix[..idx])?,
            None => self.root.clone(),
        };

        let mut out = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("list {}", dir.display()),
                        e,
                    ))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source(format!("list {}", dir.display()), e))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    Error::storage_with_source(format!("stat {}", path.display()), e)
                })?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if key.contains(TEMP_MARKER) || !key.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = stat_meta(&path, key).await? {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let file = self.resolve(path)?;
        self.meta_for(&file, path.to_string()).await
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        let _cas = self.cas.lock().await;

        let Some(data) = self.read_optional(&source).await? else {
            return Err(Error::NotFound(format!("rename source not found: {from}")));
        };
        if precondition != WritePrecondition::None {
            let current = self.read_optional(&target).await?;
            if let Some(failed) = evaluate(current.as_deref(), &precondition) {
                return Ok(failed);
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(format!("create dir {}", parent.display()), e)
            })?;
        }
        tokio::fs::rename(&source, &target).await.map_err(|e| {
            Error::storage_with_source(format!("rename {from} -> {to}"), e)
        })?;

        Ok(WriteResult::Success {
            version: content_version(&data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalFsBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalFsBackend::new(dir.path()).expect("backend");
        (dir, backend)
    }

    #[tokio::test]
    async fn put_get_roundtrip_creates_directories() {
        let (_dir, backend) = backend();
        backend
            .put("a/b/c.json", Bytes::from("{}"), WritePrecondition::None)
            .await
            .expect("put");
        assert_eq!(backend.get("a/b/c.json").await.expect("get"), Bytes::from("{}"));
    }

    #[tokio::test]
    async fn cas_uses_content_versions() {
        let (_dir, backend) = backend();
        let WriteResult::Success { version } = backend
            .put("state.json", Bytes::from("v1"), WritePrecondition::DoesNotExist)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let again = backend
            .put("state.json", Bytes::from("v1"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(again, WriteResult::PreconditionFailed { .. }));

        let updated = backend
            .put(
                "state.json",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(version.clone()),
            )
            .await
            .expect("put");
        assert!(updated.is_success());

        let stale = backend
            .put(
                "state.json",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .expect("put");
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_hides_temp_files() {
        let (dir, backend) = backend();
        for key in ["raw/enc/1.jsonl", "raw/enc/2.jsonl", "raw/pat/1.jsonl"] {
            backend
                .put(key, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }
        std::fs::write(dir.path().join("raw/enc/3.jsonl.tmp-01ABC"), b"partial").expect("temp");

        let mut keys: Vec<_> = backend
            .list("raw/enc/")
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.path)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["raw/enc/1.jsonl", "raw/enc/2.jsonl"]);
    }

    #[tokio::test]
    async fn list_reports_metadata_without_content_versions() {
        let (_dir, backend) = backend();
        let WriteResult::Success { version: written } = backend
            .put("state/a.json", Bytes::from("hello"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let listed = backend.list("state/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 5);
        assert!(listed[0].last_modified.is_some());
        assert_ne!(listed[0].version, written);

        let head = backend.head("state/a.json").await.expect("head").expect("exists");
        assert_eq!(head.version, written);
        let swapped = backend
            .put(
                "state/a.json",
                Bytes::from("hello, world"),
                WritePrecondition::MatchesVersion(head.version),
            )
            .await
            .expect("cas put");
        assert!(matches!(swapped, WriteResult::Success { .. }));

        let relisted = backend.list("state/").await.expect("list");
        assert_eq!(relisted[0].size, 12);
        assert_ne!(relisted[0].version, listed[0].version);
    }

    #[tokio::test]
    async fn rename_swaps_file_into_place() {
        let (_dir, backend) = backend();
        backend
            .put("staging/x.parquet", Bytes::from("new"), WritePrecondition::None)
            .await
            .expect("put");

        let result = backend
            .rename("staging/x.parquet", "export/m/data.parquet", WritePrecondition::DoesNotExist)
            .await
            .expect("rename");
        assert!(result.is_success());
        assert_eq!(
            backend.get("export/m/data.parquet").await.expect("get"),
            Bytes::from("new")
        );
        assert!(backend.head("staging/x.parquet").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_dir, backend) = backend();
        let err = backend.get("../etc/passwd").await.expect_err("must reject");
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
