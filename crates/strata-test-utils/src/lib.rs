//! Shared test utilities for strata integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording
//! - [`FailingBackend`]: Storage wrapper that fails selected writes
//! - Builders for source payloads and reference rows
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_test_utils::{EncounterBuilder, TracingMemoryBackend, assert_no_writes_under};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let storage = Arc::new(TracingMemoryBackend::new());
//!     let event = EncounterBuilder::new("E1", "P1").department("cardiology").build();
//!     // ... run stages ...
//!     assert_no_writes_under(&storage.operations(), "gold/");
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod failure;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use failure::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strata=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
