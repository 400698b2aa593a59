//! Core abstractions shared by every migration.
//!
//! - [`schema`]: id field declarations
//! - [`value`]: id component values bound to map columns
//! - [`identifier`]: map table naming and quoting
//! - [`traits`]: source and destination traits plus the execution context

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{IdField, IdFieldType, IdSchema};
pub use traits::{Destination, MigrateContext, Source};
pub use value::{format_ids, IdValue};
