//! Built-in process plugins.

use std::ops::ControlFlow;

use serde_json::{Map, Value};

use super::config::{Callable, SkipMethod};
use super::{read_property, ProcessPlugin, Skip};
use crate::core::traits::MigrateContext;
use crate::error::{MigrateError, Result};
use crate::row::Row;

type Output = Result<ControlFlow<Skip, Value>>;

/// Passes the stage input through. The input comes from the stage `source`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Get;

impl ProcessPlugin for Get {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, _: &str) -> Output {
        Ok(ControlFlow::Continue(value))
    }

    fn handles_multiples(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "get"
    }
}

/// Replaces an empty input with a fixed value.
///
/// Empty means null, `""`, `false`, zero, or an empty list or object. With
/// `strict` only null counts as empty.
#[derive(Debug, Clone)]
pub struct DefaultValue {
    default: Value,
    strict: bool,
}

impl DefaultValue {
    pub fn new(default: Value, strict: bool) -> Self {
        Self { default, strict }
    }
}

impl ProcessPlugin for DefaultValue {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, _: &str) -> Output {
        let empty = if self.strict {
            value.is_null()
        } else {
            is_empty_value(&value)
        };
        Ok(ControlFlow::Continue(if empty {
            self.default.clone()
        } else {
            value
        }))
    }

    fn handles_multiples(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "default_value"
    }
}

/// Looks the input up in a fixed table.
#[derive(Debug, Clone)]
pub struct StaticMap {
    map: Map<String, Value>,
    default: Option<Value>,
    bypass: bool,
}

impl StaticMap {
    pub fn new(map: Map<String, Value>, default: Option<Value>, bypass: bool) -> Self {
        Self {
            map,
            default,
            bypass,
        }
    }
}

impl ProcessPlugin for StaticMap {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, property: &str) -> Output {
        let key = scalar_string(&value);
        if let Some(mapped) = key.as_deref().and_then(|k| self.map.get(k)) {
            return Ok(ControlFlow::Continue(mapped.clone()));
        }
        if self.bypass {
            return Ok(ControlFlow::Continue(value));
        }
        if let Some(default) = &self.default {
            return Ok(ControlFlow::Continue(default.clone()));
        }

        Ok(ControlFlow::Break(Skip::ignored(format!(
            "No static mapping found for '{}' and no default value provided for destination '{}'.",
            key.unwrap_or_else(|| value.to_string()),
            property
        ))))
    }

    fn name(&self) -> &'static str {
        "static_map"
    }
}

/// Joins a list of scalars.
#[derive(Debug, Clone, Default)]
pub struct Concat {
    delimiter: String,
}

impl Concat {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl ProcessPlugin for Concat {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, property: &str) -> Output {
        let Value::Array(items) = value else {
            return Err(MigrateError::row(format!(
                "{} is not an array for concat into {}",
                value, property
            )));
        };
        let joined = items
            .iter()
            .map(|v| scalar_string(v).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(&self.delimiter);
        Ok(ControlFlow::Continue(Value::String(joined)))
    }

    fn handles_multiples(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "concat"
    }
}

/// Splits a string into a list.
///
/// A positive `limit` caps the number of parts, the last part holding the
/// rest. A negative `limit` drops that many parts from the end.
#[derive(Debug, Clone)]
pub struct Explode {
    delimiter: String,
    limit: Option<i64>,
}

impl Explode {
    pub fn new(delimiter: impl Into<String>, limit: Option<i64>) -> Self {
        Self {
            delimiter: delimiter.into(),
            limit,
        }
    }
}

impl ProcessPlugin for Explode {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, property: &str) -> Output {
        let text = match &value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Null => return Ok(ControlFlow::Continue(Value::Array(Vec::new()))),
            other => {
                return Err(MigrateError::row(format!(
                    "{} is not a string for explode into {}",
                    other, property
                )))
            }
        };

        let parts: Vec<&str> = match self.limit {
            Some(n) if n > 0 => text.splitn(n as usize, self.delimiter.as_str()).collect(),
            Some(n) if n < 0 => {
                let mut all: Vec<&str> = text.split(self.delimiter.as_str()).collect();
                all.truncate(all.len().saturating_sub(n.unsigned_abs() as usize));
                all
            }
            _ => text.split(self.delimiter.as_str()).collect(),
        };

        Ok(ControlFlow::Continue(Value::Array(
            parts.into_iter().map(|p| Value::String(p.to_string())).collect(),
        )))
    }

    fn multiple(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "explode"
    }
}

/// Applies a named scalar function.
#[derive(Debug, Clone, Copy)]
pub struct Callback {
    callable: Callable,
}

impl Callback {
    pub fn new(callable: Callable) -> Self {
        Self { callable }
    }
}

impl ProcessPlugin for Callback {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, property: &str) -> Output {
        let out = match (self.callable, value) {
            (_, Value::Null) => Value::Null,
            (Callable::Trim, Value::String(s)) => Value::String(s.trim().to_string()),
            (Callable::Lowercase, Value::String(s)) => Value::String(s.to_lowercase()),
            (Callable::Uppercase, Value::String(s)) => Value::String(s.to_uppercase()),
            (Callable::ToString, v) => {
                Value::String(scalar_string(&v).unwrap_or_else(|| v.to_string()))
            }
            (Callable::ToInt, Value::Number(n)) => match n.as_i64() {
                Some(i) => Value::from(i),
                None => Value::from(n.as_f64().unwrap_or_default().trunc() as i64),
            },
            (Callable::ToInt, Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::from(i),
                Err(_) => {
                    return Err(MigrateError::row(format!(
                        "Cannot convert '{}' to an integer for {}",
                        s, property
                    )))
                }
            },
            (Callable::ToInt, Value::Bool(b)) => Value::from(i64::from(b)),
            (callable, other) => {
                return Err(MigrateError::row(format!(
                    "{} cannot be applied to {} for {}",
                    callable.as_str(),
                    other,
                    property
                )))
            }
        };
        Ok(ControlFlow::Continue(out))
    }

    fn name(&self) -> &'static str {
        "callback"
    }
}

/// Skips the row or the property when the input is empty.
#[derive(Debug, Clone)]
pub struct SkipOnEmpty {
    method: SkipMethod,
    message: Option<String>,
}

impl SkipOnEmpty {
    pub fn new(method: SkipMethod, message: Option<String>) -> Self {
        Self { method, message }
    }
}

impl ProcessPlugin for SkipOnEmpty {
    fn transform(&self, value: Value, _: &Row, _: &MigrateContext, _: &str) -> Output {
        if !is_empty_value(&value) {
            return Ok(ControlFlow::Continue(value));
        }
        let skip = match (self.method, &self.message) {
            (SkipMethod::Process, _) => Skip::Process,
            (SkipMethod::Row, Some(message)) => Skip::ignored(message.clone()),
            (SkipMethod::Row, None) => Skip::Row,
        };
        Ok(ControlFlow::Break(skip))
    }

    fn name(&self) -> &'static str {
        "skip_on_empty"
    }
}

/// Skips the row unless the input object has `index`, else yields
/// `input[index]`. The index is read from the input, not from the row.
#[derive(Debug, Clone)]
pub struct SkipRowIfNotSet {
    index: String,
    message: Option<String>,
}

impl SkipRowIfNotSet {
    pub fn new(index: impl Into<String>, message: Option<String>) -> Self {
        Self {
            index: index.into(),
            message,
        }
    }
}

impl ProcessPlugin for SkipRowIfNotSet {
    fn transform(&self, value: Value, row: &Row, _: &MigrateContext, _: &str) -> Output {
        let found = match &value {
            Value::Object(map) => map.get(&self.index).cloned(),
            Value::Array(items) => self
                .index
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned()),
            Value::Null => Some(read_property(row, &self.index)).filter(|v| !v.is_null()),
            _ => None,
        };

        match found {
            Some(v) => Ok(ControlFlow::Continue(v)),
            None => Ok(ControlFlow::Break(match &self.message {
                Some(message) => Skip::ignored(message.clone()),
                None => Skip::Row,
            })),
        }
    }

    fn handles_multiples(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "skip_row_if_not_set"
    }
}

/// Null, `""`, `"0"`, `false`, zero, or an empty container.
pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty() || s == "0",
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Text of a scalar; `None` for lists and objects.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}
