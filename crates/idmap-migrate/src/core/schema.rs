//! Identifier schema types for sources, destinations, and the id map.
//!
//! A migration declares which fields identify a record on each side. The id
//! map derives its column layout from these declarations, so they are
//! validated once when the migration definition is loaded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

/// Storage type of one identifier component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFieldType {
    /// 64-bit signed integer.
    Integer,
    /// Text.
    String,
}

impl IdFieldType {
    /// SQLite column type for this field type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            IdFieldType::Integer => "INTEGER",
            IdFieldType::String => "TEXT",
        }
    }
}

/// One identifier component: a named, typed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdField {
    /// Property name on the row.
    pub name: String,

    /// Storage type.
    #[serde(rename = "type")]
    pub kind: IdFieldType,
}

impl IdField {
    pub fn new(name: impl Into<String>, kind: IdFieldType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, IdFieldType::Integer)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, IdFieldType::String)
    }
}

/// Ordered list of identifier fields forming a (possibly composite) key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdSchema {
    fields: Vec<IdField>,
}

impl IdSchema {
    pub fn new(fields: Vec<IdField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[IdField] {
        &self.fields
    }

    /// Field names in key order.
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check arity and field names. `what` names the schema in error messages.
    pub fn validate(&self, what: &str) -> Result<()> {
        if self.fields.is_empty() {
            return Err(MigrateError::Config(format!(
                "{} must declare at least one id field",
                what
            )));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            validate_identifier(&field.name).map_err(|e| {
                MigrateError::Config(format!("{}: invalid id field name: {}", what, e))
            })?;
            if !seen.insert(field.name.as_str()) {
                return Err(MigrateError::Config(format!(
                    "{}: duplicate id field '{}'",
                    what, field.name
                )));
            }
        }

        Ok(())
    }
}

impl From<Vec<IdField>> for IdSchema {
    fn from(fields: Vec<IdField>) -> Self {
        Self::new(fields)
    }
}
