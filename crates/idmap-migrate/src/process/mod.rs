//! Process pipeline: derives destination values from source values.
//!
//! A [`Pipeline`] is an ordered list of destination properties, each with an
//! ordered list of [`Stage`]s. A stage optionally re-reads its input from the
//! row (`source`), then hands the value to a [`ProcessPlugin`].
//!
//! Plugins return [`ControlFlow`]: `Continue(value)` feeds the next stage,
//! `Break(skip)` stops the property or the whole row. Skipping is not an
//! error and never fails the row.

mod config;
mod plugins;

pub use config::{
    Callable, PluginConfig, ProcessConfig, ProcessEntry, SkipMethod, SourceSpec, StageConfig,
};
pub use plugins::{
    Callback, Concat, DefaultValue, Explode, Get, SkipOnEmpty, SkipRowIfNotSet, StaticMap,
};

use std::fmt;
use std::ops::ControlFlow;

use serde_json::Value;
use tracing::trace;

use crate::core::traits::MigrateContext;
use crate::error::Result;
use crate::row::{Row, PROPERTY_SEPARATOR};

/// How a plugin stops processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// Drop the row silently. No mapping change, no message.
    Row,
    /// Stop the current property's chain and leave the property unset.
    Process,
    /// Drop the row, recording an IGNORED mapping and an informational
    /// message.
    Ignored(String),
}

impl Skip {
    pub fn ignored(message: impl Into<String>) -> Self {
        Skip::Ignored(message.into())
    }
}

/// One transformation step.
pub trait ProcessPlugin: Send + fmt::Debug {
    /// Transform `value` for `destination_property`.
    fn transform(
        &self,
        value: Value,
        row: &Row,
        ctx: &MigrateContext,
        destination_property: &str,
    ) -> Result<ControlFlow<Skip, Value>>;

    /// The output is a list whose elements later stages take one at a time.
    fn multiple(&self) -> bool {
        false
    }

    /// The plugin takes a whole list even after a list-producing stage.
    fn handles_multiples(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// A plugin plus the optional row property it reads its input from.
#[derive(Debug)]
pub struct Stage {
    source: Option<SourceSpec>,
    plugin: Box<dyn ProcessPlugin>,
}

impl Stage {
    pub fn new(plugin: Box<dyn ProcessPlugin>) -> Self {
        Self {
            source: None,
            plugin,
        }
    }

    pub fn with_source(mut self, source: SourceSpec) -> Self {
        self.source = Some(source);
        self
    }

    /// Shorthand stage copying one row property.
    pub fn get(source: impl Into<String>) -> Self {
        Self::new(Box::new(Get)).with_source(SourceSpec::One(source.into()))
    }

    pub fn plugin_name(&self) -> &'static str {
        self.plugin.name()
    }
}

/// Ordered property → stages mapping.
#[derive(Debug, Default)]
pub struct Pipeline {
    properties: Vec<(String, Vec<Stage>)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property. Properties run in insertion order, so a later
    /// property may read an earlier one with `@name`.
    pub fn add(&mut self, property: impl Into<String>, stages: Vec<Stage>) -> &mut Self {
        self.properties.push((property.into(), stages));
        self
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(p, _)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Run every property chain and write the results to the row's
    /// destination side.
    ///
    /// Returns `Break` with [`Skip::Row`] or [`Skip::Ignored`] when a plugin
    /// drops the row. Destination values set before the skip are kept.
    pub fn run(&self, row: &mut Row, ctx: &MigrateContext) -> Result<ControlFlow<Skip>> {
        for (property, stages) in &self.properties {
            match run_property(stages, row, ctx, property)? {
                ControlFlow::Continue(value) => set_destination(row, property, value),
                ControlFlow::Break(Skip::Process) => {
                    trace!("{}: skipped process of {}", ctx.migration_id(), property);
                }
                ControlFlow::Break(skip) => return Ok(ControlFlow::Break(skip)),
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

fn run_property(
    stages: &[Stage],
    row: &Row,
    ctx: &MigrateContext,
    property: &str,
) -> Result<ControlFlow<Skip, Value>> {
    let mut value = Value::Null;
    let mut multiple = false;

    for stage in stages {
        if let Some(source) = &stage.source {
            value = source.read(row);
            multiple = false;
        }

        if multiple && !stage.plugin.handles_multiples() {
            let items = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match stage.plugin.transform(item, row, ctx, property)? {
                    ControlFlow::Continue(v) => out.push(v),
                    ControlFlow::Break(Skip::Process) => {}
                    ControlFlow::Break(skip) => return Ok(ControlFlow::Break(skip)),
                }
            }
            value = Value::Array(out);
        } else {
            value = match stage.plugin.transform(value, row, ctx, property)? {
                ControlFlow::Continue(v) => v,
                ControlFlow::Break(skip) => return Ok(ControlFlow::Break(skip)),
            };
            multiple = stage.plugin.multiple();
        }
    }

    Ok(ControlFlow::Continue(value))
}

fn set_destination(row: &mut Row, property: &str, value: Value) {
    if property.contains(PROPERTY_SEPARATOR) {
        let path: Vec<&str> = property.split(PROPERTY_SEPARATOR).collect();
        row.set_destination_property_deep(&path, value);
    } else {
        row.set_destination_property(property, value);
    }
}

/// Read a row property. `@name` addresses the destination side.
pub(crate) fn read_property(row: &Row, name: &str) -> Value {
    let found = match name.strip_prefix('@') {
        Some(dest) => row.destination_property(dest),
        None => row.source_property(name),
    };
    found.cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{IdField, IdSchema};
    use serde_json::json;

    fn row(values: Value) -> Row {
        let ids = IdSchema::new(vec![IdField::integer("id")]);
        Row::new(values.as_object().cloned().unwrap(), &ids, &ids).unwrap()
    }

    #[derive(Debug)]
    struct Upper;

    impl ProcessPlugin for Upper {
        fn transform(
            &self,
            value: Value,
            _row: &Row,
            _ctx: &MigrateContext,
            _destination_property: &str,
        ) -> Result<ControlFlow<Skip, Value>> {
            Ok(ControlFlow::Continue(match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            }))
        }

        fn name(&self) -> &'static str {
            "upper"
        }
    }

    #[derive(Debug)]
    struct SkipWith(Skip);

    impl ProcessPlugin for SkipWith {
        fn transform(
            &self,
            _value: Value,
            _row: &Row,
            _ctx: &MigrateContext,
            _destination_property: &str,
        ) -> Result<ControlFlow<Skip, Value>> {
            Ok(ControlFlow::Break(self.0.clone()))
        }

        fn name(&self) -> &'static str {
            "skip_with"
        }
    }

    #[test]
    fn test_stages_chain_in_order() {
        let mut pipeline = Pipeline::new();
        pipeline.add("title", vec![Stage::get("name"), Stage::new(Box::new(Upper))]);
        pipeline.add("copy", vec![Stage::get("@title")]);

        let mut row = row(json!({"id": 1, "name": "ada"}));
        let ctx = MigrateContext::new("test");
        assert_eq!(pipeline.run(&mut row, &ctx).unwrap(), ControlFlow::Continue(()));
        assert_eq!(row.destination_property("title"), Some(&json!("ADA")));
        assert_eq!(row.destination_property("copy"), Some(&json!("ADA")));
    }

    #[test]
    fn test_skip_process_leaves_property_unset() {
        let mut pipeline = Pipeline::new();
        pipeline.add("a", vec![Stage::get("id"), Stage::new(Box::new(SkipWith(Skip::Process)))]);
        pipeline.add("b", vec![Stage::get("id")]);

        let mut row = row(json!({"id": 1}));
        let ctx = MigrateContext::new("test");
        assert!(pipeline.run(&mut row, &ctx).unwrap().is_continue());
        assert!(!row.has_destination_property("a"));
        assert_eq!(row.destination_property("b"), Some(&json!(1)));
    }

    #[test]
    fn test_skip_row_stops_pipeline() {
        let mut pipeline = Pipeline::new();
        pipeline.add("a", vec![Stage::new(Box::new(SkipWith(Skip::Row)))]);
        pipeline.add("b", vec![Stage::get("id")]);

        let mut row = row(json!({"id": 1}));
        let ctx = MigrateContext::new("test");
        assert_eq!(pipeline.run(&mut row, &ctx).unwrap(), ControlFlow::Break(Skip::Row));
        assert!(!row.has_destination_property("b"));
    }

    #[test]
    fn test_nested_destination_property() {
        let mut pipeline = Pipeline::new();
        pipeline.add("body/value", vec![Stage::get("text")]);

        let mut row = row(json!({"id": 1, "text": "hello"}));
        pipeline.run(&mut row, &MigrateContext::new("test")).unwrap();
        assert_eq!(row.destination_property("body"), Some(&json!({"value": "hello"})));
    }

    #[test]
    fn test_multiple_applies_per_element() {
        let mut pipeline = Pipeline::new();
        pipeline.add(
            "tags",
            vec![
                Stage::new(Box::new(Explode::new(",", None)))
                    .with_source(SourceSpec::One("tags".into())),
                Stage::new(Box::new(Upper)),
            ],
        );

        let mut row = row(json!({"id": 1, "tags": "a,b"}));
        pipeline.run(&mut row, &MigrateContext::new("test")).unwrap();
        assert_eq!(row.destination_property("tags"), Some(&json!(["A", "B"])));
    }
}
