//! Error types for the migration library.

use std::panic::Location;

use thiserror::Error;

use crate::id_map::{MappingStatus, MessageLevel};

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Id map or destination storage error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A declared source id field is absent from the source values
    #[error("Invalid source identifier: missing field '{field}'")]
    InvalidSourceId { field: String },

    /// Attempt to change the source side of a frozen row
    #[error("Cannot set source property '{0}' on a frozen row")]
    FrozenRow(String),

    /// An id tuple does not match the arity of its schema
    #[error("Expected {expected} {side} id values, got {got}")]
    IdArity {
        side: &'static str,
        expected: usize,
        got: usize,
    },

    /// Source iteration failed (rewind or advance)
    #[error("Source error: {0}")]
    Source(String),

    /// Destination failed in a way it could describe
    #[error("Destination error: {0}")]
    Destination(String),

    /// Row-level failure carrying an explicit message level and map status
    #[error("{message}")]
    Row {
        message: String,
        level: MessageLevel,
        status: MappingStatus,
    },

    /// Unexpected failure, tagged with the call site that raised it
    #[error("{message} ({location})")]
    Unexpected {
        message: String,
        location: &'static Location<'static>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a row-level error that fails the row with an ERROR message.
    pub fn row(message: impl Into<String>) -> Self {
        MigrateError::Row {
            message: message.into(),
            level: MessageLevel::Error,
            status: MappingStatus::Failed,
        }
    }

    /// Create a row-level error with an explicit level and map status.
    pub fn row_with(
        message: impl Into<String>,
        level: MessageLevel,
        status: MappingStatus,
    ) -> Self {
        MigrateError::Row {
            message: message.into(),
            level,
            status,
        }
    }

    /// Create an Unexpected error recording the caller's location.
    #[track_caller]
    pub fn unexpected(message: impl Into<String>) -> Self {
        MigrateError::Unexpected {
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Create a Source error
    pub fn source_failure(message: impl Into<String>) -> Self {
        MigrateError::Source(message.into())
    }

    /// Create a Destination error
    pub fn destination(message: impl Into<String>) -> Self {
        MigrateError::Destination(message.into())
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
