//! # idmap-migrate
//!
//! Migration execution engine with a persistent source ↔ destination id map.
//!
//! Records move from a [`Source`] through a process [`Pipeline`] into a
//! [`Destination`], one migration at a time. Every row outcome is recorded
//! in the [`IdMap`] before the next row is read, which makes runs:
//!
//! - **Idempotent**: the source key is the merge key of every mapping write
//! - **Isolated**: a failing row is recorded as failed and the run goes on
//! - **Resumable**: a run stopped by a budget continues where it left off
//! - **Reversible**: rollback removes what a migration imported
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use idmap_migrate::{Config, MigrationCatalog, RunOptions, TracingSink};
//!
//! fn main() -> idmap_migrate::Result<()> {
//!     let config = Config::load("migrate.yaml")?;
//!     let catalog = MigrationCatalog::new(config);
//!     let mut exec = catalog.executable("users", Arc::new(TracingSink), RunOptions::default())?;
//!     let summary = exec.import()?;
//!     println!("Processed {} rows", summary.counts.processed);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod core;
pub mod destination;
pub mod error;
pub mod executable;
pub mod id_map;
pub mod message;
pub mod process;
pub mod row;
pub mod source;

// Re-exports for convenient access
pub use catalog::MigrationCatalog;
pub use config::{Config, LimitsConfig, MigrationDefinition};
pub use self::core::{
    format_ids, Destination, IdField, IdFieldType, IdSchema, IdValue, MigrateContext, Source,
};
pub use error::{MigrateError, Result};
pub use executable::{MigrateExecutable, Migration, RunOptions, RunStatus, RunSummary, StatusReport};
pub use id_map::{IdMap, MappingRecord, MappingStatus, MessageLevel, RollbackAction, SqlIdMap};
pub use message::{MemorySink, MessageSink, TracingSink};
pub use process::{Pipeline, ProcessPlugin, Skip};
pub use row::Row;
