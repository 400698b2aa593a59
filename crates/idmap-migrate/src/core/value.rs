//! Identifier values exchanged between rows, destinations, and the id map.
//!
//! Row properties are arbitrary JSON values; identifier components are
//! narrowed to [`IdValue`] so they can be bound to typed key columns.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::IdFieldType;

/// One component of a source or destination identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    /// Missing or NULL component.
    Null,
    /// Integer component.
    Integer(i64),
    /// Text component.
    String(String),
}

impl IdValue {
    /// Narrow a JSON value into an id component.
    ///
    /// Floats and booleans keep their JSON text; arrays and objects cannot
    /// identify a record and become NULL.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => IdValue::Null,
            Value::Number(n) => match n.as_i64() {
                Some(i) => IdValue::Integer(i),
                None => IdValue::String(n.to_string()),
            },
            Value::String(s) => IdValue::String(s.clone()),
            Value::Bool(b) => IdValue::String(b.to_string()),
            Value::Array(_) | Value::Object(_) => IdValue::Null,
        }
    }

    /// Widen back into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            IdValue::Null => Value::Null,
            IdValue::Integer(i) => Value::from(*i),
            IdValue::String(s) => Value::String(s.clone()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, IdValue::Null)
    }

    /// NULL or the empty string. Such a component cannot key a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            IdValue::Null => true,
            IdValue::String(s) => s.is_empty(),
            IdValue::Integer(_) => false,
        }
    }

    /// Convert to the representation of a typed key column.
    ///
    /// Numeric strings bound for an integer column become integers so that
    /// `"7"` and `7` address the same mapping.
    #[must_use]
    pub fn coerce(&self, kind: IdFieldType) -> IdValue {
        match (self, kind) {
            (IdValue::String(s), IdFieldType::Integer) => match s.trim().parse::<i64>() {
                Ok(i) => IdValue::Integer(i),
                Err(_) => self.clone(),
            },
            (IdValue::Integer(i), IdFieldType::String) => IdValue::String(i.to_string()),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Null => write!(f, "NULL"),
            IdValue::Integer(i) => write!(f, "{}", i),
            IdValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// Render an id tuple as `a:b:c` for messages and logs.
pub fn format_ids(ids: &[IdValue]) -> String {
    ids.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(":")
}

impl From<i64> for IdValue {
    fn from(v: i64) -> Self {
        IdValue::Integer(v)
    }
}

impl From<i32> for IdValue {
    fn from(v: i32) -> Self {
        IdValue::Integer(v as i64)
    }
}

impl From<String> for IdValue {
    fn from(v: String) -> Self {
        IdValue::String(v)
    }
}

impl From<&str> for IdValue {
    fn from(v: &str) -> Self {
        IdValue::String(v.to_string())
    }
}

impl ToSql for IdValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            IdValue::Null => ToSqlOutput::from(rusqlite::types::Null),
            IdValue::Integer(i) => ToSqlOutput::from(*i),
            IdValue::String(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl FromSql for IdValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => IdValue::Null,
            ValueRef::Integer(i) => IdValue::Integer(i),
            ValueRef::Real(r) => IdValue::String(r.to_string()),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                IdValue::String(String::from_utf8_lossy(t).into_owned())
            }
        })
    }
}
