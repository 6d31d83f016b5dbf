//! Run-lease helpers shared by every stage.

use std::sync::Arc;

use strata_core::lock::{LeaseGuard, RunLease};
use strata_core::storage::StorageBackend;
use strata_core::storage_keys::LockKey;
use strata_core::RunId;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Acquires the single-writer lease `locks/{scope}/{name}.lock.json`.
///
/// # Errors
///
/// Returns `PipelineError::LeaseBusy` if another run holds the lease after
/// all retries.
pub(crate) async fn acquire<S: StorageBackend>(
    storage: &Arc<S>,
    scope: &str,
    name: &str,
    config: &PipelineConfig,
    run_id: RunId,
) -> Result<LeaseGuard<S>> {
    let lease = RunLease::new(Arc::clone(storage), &LockKey::lease(scope, name));
    lease
        .acquire_for(
            config.lease_ttl,
            config.lease_max_retries,
            Some(format!("{scope} run {run_id}")),
        )
        .await
        .map_err(|e| busy(scope, name, e))
}

/// Fails with `LeaseBusy` if the guard no longer owns its lease.
pub(crate) async fn ensure_held<S: StorageBackend>(
    guard: &LeaseGuard<S>,
    scope: &str,
    name: &str,
) -> Result<()> {
    guard.ensure_held().await.map_err(|e| busy(scope, name, e))
}

/// Releases a lease at the end of a stage run, logging failures.
///
/// An unreleased lease expires after its TTL, so failure here only delays
/// the next run.
pub(crate) async fn release<S: StorageBackend>(guard: LeaseGuard<S>, scope: &str, name: &str) {
    if let Err(e) = guard.release().await {
        tracing::warn!(scope, name, error = %e, "failed to release lease");
    }
}

fn busy(scope: &str, name: &str, err: strata_core::Error) -> PipelineError {
    match err {
        strata_core::Error::PreconditionFailed { message } => PipelineError::LeaseBusy {
            scope: format!("{scope}/{name}"),
            message,
        },
        other => other.into(),
    }
}
