//! Storage-backed run leases.
//!
//! Cursors, watermarks and manifests are single-writer records: only one
//! in-flight run per source, entity type or mart may advance them. A lease
//! enforces that using the storage backend as the coordination point:
//!
//! 1. Acquisition writes a lease file with `DoesNotExist`; only one writer wins.
//! 2. An existing lease that has expired is taken over with `MatchesVersion`.
//! 3. Every acquisition increments a sequence number, exposed as a
//!    [`FencingToken`]. Progress records store the token of their last
//!    writer so a stale holder cannot commit over a newer one.
//! 4. Release overwrites the lease with an expired record via CAS; it never
//!    deletes, so a new holder's lease is never removed by accident.
//!
//! # Example
//!
//! ```rust,ignore
//! let lease = RunLease::new(storage.clone(), &LockKey::lease("conform", "encounter"));
//! let guard = lease.acquire(Duration::from_secs(30), 5).await?;
//! // ... single-writer section ...
//! guard.release().await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};
use crate::storage_keys::{LockKey, StorageKey};

/// Default lease TTL (30 seconds).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Default maximum attempts for lease acquisition.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Monotonic token derived from the lease sequence number.
///
/// A higher token always wins over a lower one. Only this module creates
/// tokens; everything else obtains them from a [`LeaseGuard`] or reads them
/// back from stored records via [`FencingToken::from_stored`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    pub(crate) const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Rehydrates a token previously persisted by a lease holder.
    #[must_use]
    pub const fn from_stored(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}

/// Lease file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    /// Unique lease holder ID.
    pub holder_id: String,
    /// When the lease expires.
    pub expires_at: DateTime<Utc>,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Monotonically increasing acquisition counter.
    #[serde(default)]
    pub sequence_number: u64,
    /// Optional description of the run holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LeaseInfo {
    fn new(holder_id: &str, ttl: Duration, sequence_number: u64, operation: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_string(),
            expires_at: now + chrono_ttl(ttl),
            acquired_at: now,
            sequence_number,
            operation,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::serialization("serialize lease", e))
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

async fn read_lease<S: StorageBackend + ?Sized>(storage: &S, path: &str) -> Result<Option<LeaseInfo>> {
    match storage.get(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::serialization("parse lease", e)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

enum LeaseError {
    Held(String),
    Storage(Error),
}

/// A single-writer lease backed by object storage.
pub struct RunLease<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    path: String,
    holder_id: String,
}

impl<S: StorageBackend + ?Sized> Clone for RunLease<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            path: self.path.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> RunLease<S> {
    /// Creates a lease handle with a fresh holder identity.
    #[must_use]
    pub fn new(storage: Arc<S>, key: &LockKey) -> Self {
        Self {
            storage,
            path: key.path().to_string(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder ID for this handle.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquires the lease, retrying with backoff while another holder has it.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` if the lease is still held after
    /// `max_retries` attempts, or a storage error.
    pub async fn acquire(&self, ttl: Duration, max_retries: u32) -> Result<LeaseGuard<S>> {
        self.acquire_for(ttl, max_retries, None).await
    }

    /// Acquires the lease and records which operation holds it.
    ///
    /// # Errors
    ///
    /// Same as [`RunLease::acquire`].
    pub async fn acquire_for(
        &self,
        ttl: Duration,
        max_retries: u32,
        operation: Option<String>,
    ) -> Result<LeaseGuard<S>> {
        let mut attempts = 0;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire(ttl, operation.clone()).await {
                Ok(guard) => return Ok(guard),
                Err(LeaseError::Held(holder)) => {
                    attempts += 1;
                    if attempts >= max_retries.max(1) {
                        return Err(Error::PreconditionFailed {
                            message: format!(
                                "lease {} held by {holder} after {attempts} attempts",
                                self.path
                            ),
                        });
                    }
                    tracing::debug!(lease = %self.path, holder = %holder, attempts, "lease busy, backing off");
                    let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(jitter_millis());
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(LeaseError::Storage(e)) => return Err(e),
            }
        }
    }

    async fn try_acquire(
        &self,
        ttl: Duration,
        operation: Option<String>,
    ) -> std::result::Result<LeaseGuard<S>, LeaseError> {
        let fresh = LeaseInfo::new(&self.holder_id, ttl, 1, operation.clone());
        let bytes = fresh.to_bytes().map_err(LeaseError::Storage)?;

        if let WriteResult::Success { version } = self
            .storage
            .put(&self.path, bytes, WritePrecondition::DoesNotExist)
            .await
            .map_err(LeaseError::Storage)?
        {
            return Ok(self.guard(version, 1));
        }

        // Bind the expiry decision to the version used for the takeover CAS.
        let Some(meta) = self
            .storage
            .head(&self.path)
            .await
            .map_err(LeaseError::Storage)?
        else {
            return Err(LeaseError::Held("race".into()));
        };

        match read_lease(self.storage.as_ref(), &self.path)
            .await
            .map_err(LeaseError::Storage)?
        {
            Some(info) if info.is_expired() => {
                let sequence = info.sequence_number.saturating_add(1);
                let takeover = LeaseInfo::new(&self.holder_id, ttl, sequence, operation);
                let bytes = takeover.to_bytes().map_err(LeaseError::Storage)?;
                match self
                    .storage
                    .put(&self.path, bytes, WritePrecondition::MatchesVersion(meta.version))
                    .await
                    .map_err(LeaseError::Storage)?
                {
                    WriteResult::Success { version } => Ok(self.guard(version, sequence)),
                    WriteResult::PreconditionFailed { .. } => Err(LeaseError::Held("unknown".into())),
                }
            }
            Some(info) => Err(LeaseError::Held(info.holder_id)),
            None => Err(LeaseError::Held("race".into())),
        }
    }

    fn guard(&self, version: String, sequence: u64) -> LeaseGuard<S> {
        LeaseGuard {
            storage: Arc::clone(&self.storage),
            path: self.path.clone(),
            holder_id: self.holder_id.clone(),
            version,
            fencing_token: FencingToken::new(sequence),
            released: false,
        }
    }

    /// Returns true if any holder currently has an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease state could not be read.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(read_lease(self.storage.as_ref(), &self.path)
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lease record without acquiring it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease state could not be read.
    pub async fn info(&self) -> Result<Option<LeaseInfo>> {
        read_lease(self.storage.as_ref(), &self.path).await
    }

    /// Forcefully removes the lease (operator recovery only).
    ///
    /// # Errors
    ///
    /// Returns an error if the lease file could not be deleted.
    pub async fn force_break(&self) -> Result<()> {
        self.storage.delete(&self.path).await
    }
}

/// RAII guard for a held lease.
///
/// The lease is released on drop (best effort, requires a Tokio runtime);
/// prefer [`LeaseGuard::release`] to observe release errors.
pub struct LeaseGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    path: String,
    holder_id: String,
    version: String,
    fencing_token: FencingToken,
    released: bool,
}

impl<S: StorageBackend + ?Sized> LeaseGuard<S> {
    /// Returns the holder ID.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the fencing token for this acquisition.
    #[must_use]
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Verifies this guard still owns the lease and it has not expired.
    ///
    /// Called right before a commit point so a holder that stalled past its
    /// TTL does not publish over a newer run.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` if ownership was lost.
    pub async fn ensure_held(&self) -> Result<()> {
        match read_lease(self.storage.as_ref(), &self.path).await? {
            Some(info)
                if info.holder_id == self.holder_id
                    && info.sequence_number == self.fencing_token.sequence()
                    && !info.is_expired() =>
            {
                Ok(())
            }
            Some(info) => Err(Error::PreconditionFailed {
                message: format!(
                    "lease {} lost: now held by {} (sequence {})",
                    self.path, info.holder_id, info.sequence_number
                ),
            }),
            None => Err(Error::PreconditionFailed {
                message: format!("lease {} disappeared", self.path),
            }),
        }
    }

    /// Extends the lease TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is no longer held by this guard.
    pub async fn extend(&mut self, ttl: Duration) -> Result<()> {
        let Some(mut info) = read_lease(self.storage.as_ref(), &self.path).await? else {
            return Err(Error::NotFound(self.path.clone()));
        };
        if info.holder_id != self.holder_id {
            return Err(Error::PreconditionFailed {
                message: "lease held by different holder".into(),
            });
        }
        info.expires_at = Utc::now() + chrono_ttl(ttl);

        match self
            .storage
            .put(
                &self.path,
                info.to_bytes()?,
                WritePrecondition::MatchesVersion(self.version.clone()),
            )
            .await?
        {
            WriteResult::Success { version } => {
                self.version = version;
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                message: "lease modified by another holder".into(),
            }),
        }
    }

    /// Explicitly releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the release write fails.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_lease(
            self.storage.as_ref(),
            &self.path,
            &self.holder_id,
            self.version.clone(),
        )
        .await
    }
}

/// Overwrites the lease with an expired record, preserving the sequence number.
async fn release_lease<S: StorageBackend + ?Sized>(
    storage: &S,
    path: &str,
    holder_id: &str,
    version: String,
) -> Result<()> {
    let Some(info) = read_lease(storage, path).await? else {
        return Ok(());
    };
    if info.holder_id != holder_id {
        return Ok(());
    }
    let expired = LeaseInfo {
        expires_at: Utc::now() - chrono::Duration::seconds(1),
        operation: None,
        ..info
    };
    // A precondition failure means another holder took over; leave it intact.
    let _ = storage
        .put(path, expired.to_bytes()?, WritePrecondition::MatchesVersion(version))
        .await?;
    Ok(())
}

impl<S: StorageBackend + ?Sized> Drop for LeaseGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Without a runtime the TTL handles cleanup.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let storage = Arc::clone(&self.storage);
        let path = self.path.clone();
        let holder = self.holder_id.clone();
        let version = self.version.clone();
        handle.spawn(async move {
            if let Err(e) = release_lease(storage.as_ref(), &path, &holder, version).await {
                tracing::warn!(lease = %path, error = %e, "failed to release lease on drop");
            }
        });
    }
}

/// Jitter for backoff (0-49ms) without pulling in an RNG.
fn jitter_millis() -> u64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    u64::from(nanos) % 50
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn key() -> LockKey {
        LockKey::lease("conform", "encounter")
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = RunLease::new(backend.clone(), &key());

        let guard = lease.acquire(Duration::from_secs(30), 5).await.expect("acquire");
        assert_eq!(guard.fencing_token().sequence(), 1);
        assert!(lease.is_held().await.expect("check"));

        guard.release().await.expect("release");
        assert!(!lease.is_held().await.expect("check"));
    }

    #[tokio::test]
    async fn second_holder_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let first = RunLease::new(backend.clone(), &key());
        let second = RunLease::new(backend.clone(), &key());

        let _guard = first.acquire(Duration::from_secs(30), 1).await.expect("acquire");
        let err = second
            .acquire(Duration::from_secs(30), 1)
            .await
            .err()
            .expect("must be busy");
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_with_higher_token() {
        let backend = Arc::new(MemoryBackend::new());
        let first = RunLease::new(backend.clone(), &key());
        let second = RunLease::new(backend.clone(), &key());

        let stale = first.acquire(Duration::from_millis(1), 1).await.expect("acquire");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = second.acquire(Duration::from_secs(30), 1).await.expect("takeover");
        assert!(fresh.fencing_token() > stale.fencing_token());
        assert_eq!(fresh.fencing_token().sequence(), 2);

        // The stalled holder notices before committing.
        assert!(stale.ensure_held().await.is_err());
        assert!(fresh.ensure_held().await.is_ok());
        fresh.release().await.expect("release");
    }

    #[tokio::test]
    async fn sequence_survives_release() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = RunLease::new(backend.clone(), &key());

        let guard = lease.acquire(Duration::from_secs(30), 1).await.expect("acquire");
        guard.release().await.expect("release");

        let again = RunLease::new(backend.clone(), &key())
            .acquire(Duration::from_secs(30), 1)
            .await
            .expect("reacquire");
        assert_eq!(again.fencing_token().sequence(), 2);
        again.release().await.expect("release");
    }

    #[tokio::test]
    async fn operation_is_recorded() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = RunLease::new(backend.clone(), &key());
        let guard = lease
            .acquire_for(Duration::from_secs(30), 1, Some("conform run 01J".into()))
            .await
            .expect("acquire");

        let info = lease.info().await.expect("info").expect("present");
        assert_eq!(info.operation.as_deref(), Some("conform run 01J"));
        guard.release().await.expect("release");
    }

    #[tokio::test]
    async fn extend_pushes_expiry() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = RunLease::new(backend.clone(), &key());
        let mut guard = lease.acquire(Duration::from_secs(1), 1).await.expect("acquire");

        guard.extend(Duration::from_secs(60)).await.expect("extend");
        let info = lease.info().await.expect("info").expect("present");
        assert!(info.expires_at > Utc::now() + chrono::Duration::seconds(30));
        guard.release().await.expect("release");
    }

    #[tokio::test]
    async fn force_break_clears_lease() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = RunLease::new(backend.clone(), &key());
        let _guard = lease.acquire(Duration::from_secs(30), 1).await.expect("acquire");

        lease.force_break().await.expect("break");
        assert!(!lease.is_held().await.expect("check"));
    }
}
