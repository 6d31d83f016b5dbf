//! # strata-core
//!
//! Shared primitives for the strata tiered pipeline.
//!
//! - **Storage**: the conditional-write object store contract every tier
//!   and progress record is built on, with in-memory and local filesystem
//!   backends
//! - **Storage keys**: typed path constructors for each tier
//! - **Partitions**: canonical `key=value` partition paths
//! - **Leases**: storage-backed single-writer leases with fencing tokens
//! - **Errors and observability**: shared error type, logging setup
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let storage = MemoryBackend::new();
//! let key = StateKey::cursor("encounters");
//! assert_eq!(key.path(), "state/cursors/encounters.json");
//! # let _ = storage;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod local;
pub mod lock;
pub mod observability;
pub mod partition;
pub mod storage;
pub mod storage_keys;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::RunId;
    pub use crate::local::LocalFsBackend;
    pub use crate::lock::{FencingToken, LeaseGuard, LeaseInfo, RunLease};
    pub use crate::partition::{PartitionKey, PartitionKeyParseError};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::storage_keys::{
        ConformedKey, ExportKey, GoldKey, LockKey, QuarantineKey, RawKey, StateKey, StorageKey,
    };
}

pub use error::{Error, Result};
pub use id::RunId;
pub use local::LocalFsBackend;
pub use lock::{FencingToken, LeaseGuard, LeaseInfo, RunLease, DEFAULT_LEASE_TTL, DEFAULT_MAX_RETRIES};
pub use observability::{init_logging, stage_span, LogFormat};
pub use partition::{PartitionKey, PartitionKeyParseError};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
