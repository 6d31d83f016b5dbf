//! CLI subcommand implementations.

pub mod aggregate;
pub mod conform;
pub mod ingest;
pub mod ingest_reference;
pub mod inspect;
pub mod publish;
pub mod quarantine;
pub mod run;
pub mod status;
