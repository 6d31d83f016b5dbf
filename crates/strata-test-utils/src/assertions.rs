//! Custom assertion helpers for integration tests.

use std::collections::BTreeMap;

use bytes::Bytes;
use strata_core::storage::StorageBackend;

use crate::storage::StorageOp;

/// Asserts that no recorded operation wrote under `prefix`.
///
/// # Panics
///
/// Panics if any put, delete or rename touched a path under `prefix`.
pub fn assert_no_writes_under(ops: &[StorageOp], prefix: &str) {
    let offending: Vec<&StorageOp> = ops
        .iter()
        .filter(|op| op.is_write() && op.path().starts_with(prefix))
        .collect();
    assert!(
        offending.is_empty(),
        "Expected no writes under {prefix}, found {offending:?}"
    );
}

/// Asserts that at least one recorded operation wrote under `prefix`.
///
/// # Panics
///
/// Panics if nothing was written under `prefix`.
pub fn assert_wrote_under(ops: &[StorageOp], prefix: &str) {
    assert!(
        ops.iter()
            .any(|op| op.is_write() && op.path().starts_with(prefix)),
        "Expected a write under {prefix}"
    );
}

/// Reads every object under `prefix` into a path-ordered map.
///
/// # Panics
///
/// Panics if listing or reading fails.
pub async fn snapshot_prefix<S: StorageBackend + ?Sized>(
    storage: &S,
    prefix: &str,
) -> BTreeMap<String, Bytes> {
    let mut snapshot = BTreeMap::new();
    for meta in storage.list(prefix).await.expect("list") {
        let data = storage.get(&meta.path).await.expect("get");
        snapshot.insert(meta.path, data);
    }
    snapshot
}

/// Asserts two prefix snapshots hold the same paths with byte-identical content.
///
/// # Panics
///
/// Panics on the first differing path.
pub fn assert_snapshots_identical(before: &BTreeMap<String, Bytes>, after: &BTreeMap<String, Bytes>) {
    let before_paths: Vec<&String> = before.keys().collect();
    let after_paths: Vec<&String> = after.keys().collect();
    assert_eq!(before_paths, after_paths, "Object sets differ");
    for (path, data) in before {
        assert!(
            after.get(path) == Some(data),
            "Object {path} changed ({} -> {} bytes)",
            data.len(),
            after.get(path).map_or(0, Bytes::len)
        );
    }
}
