//! Serde shapes of the `process:` section and their conversion into a
//! [`Pipeline`].
//!
//! ```yaml
//! process:
//!   title: name                # shorthand for a `get` stage
//!   status:
//!     plugin: static_map
//!     source: state
//!     map: { active: 1, blocked: 0 }
//!   tags:
//!     - plugin: explode
//!       source: tags
//!       delimiter: ","
//!     - plugin: callback
//!       callable: trim
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::plugins::{
    Callback, Concat, DefaultValue, Explode, Get, SkipOnEmpty, SkipRowIfNotSet, StaticMap,
};
use super::{read_property, Pipeline, ProcessPlugin, Stage};
use crate::error::{MigrateError, Result};
use crate::row::Row;

/// Row property, or list of properties, a stage reads its input from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    One(String),
    Many(Vec<String>),
}

impl SourceSpec {
    /// Read the input value. A list of properties reads into a list.
    pub fn read(&self, row: &Row) -> Value {
        match self {
            SourceSpec::One(name) => read_property(row, name),
            SourceSpec::Many(names) => {
                Value::Array(names.iter().map(|n| read_property(row, n)).collect())
            }
        }
    }
}

/// Scalar function applied by the `callback` plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callable {
    Trim,
    Lowercase,
    Uppercase,
    ToString,
    ToInt,
}

impl Callable {
    pub fn as_str(self) -> &'static str {
        match self {
            Callable::Trim => "trim",
            Callable::Lowercase => "lowercase",
            Callable::Uppercase => "uppercase",
            Callable::ToString => "to_string",
            Callable::ToInt => "to_int",
        }
    }
}

/// What `skip_on_empty` skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipMethod {
    Row,
    Process,
}

/// Plugin selection and plugin-specific settings of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plugin", rename_all = "snake_case")]
pub enum PluginConfig {
    Get,
    DefaultValue {
        default_value: Value,
        #[serde(default)]
        strict: bool,
    },
    StaticMap {
        #[serde(deserialize_with = "string_keys")]
        map: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<Value>,
        #[serde(default)]
        bypass: bool,
    },
    Concat {
        #[serde(default)]
        delimiter: String,
    },
    Explode {
        delimiter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
    },
    Callback {
        callable: Callable,
    },
    SkipOnEmpty {
        method: SkipMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SkipRowIfNotSet {
        index: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// One configured stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,

    #[serde(flatten)]
    pub plugin: PluginConfig,
}

impl StageConfig {
    /// Instantiate the plugin, checking its settings.
    pub fn build(&self) -> Result<Stage> {
        let plugin: Box<dyn ProcessPlugin> = match &self.plugin {
            PluginConfig::Get => {
                if self.source.is_none() {
                    return Err(MigrateError::Config(
                        "get plugin requires a source".into(),
                    ));
                }
                Box::new(Get)
            }
            PluginConfig::DefaultValue {
                default_value,
                strict,
            } => Box::new(DefaultValue::new(default_value.clone(), *strict)),
            PluginConfig::StaticMap {
                map,
                default_value,
                bypass,
            } => Box::new(StaticMap::new(map.clone(), default_value.clone(), *bypass)),
            PluginConfig::Concat { delimiter } => Box::new(Concat::new(delimiter.clone())),
            PluginConfig::Explode { delimiter, limit } => {
                if delimiter.is_empty() {
                    return Err(MigrateError::Config(
                        "explode delimiter cannot be empty".into(),
                    ));
                }
                Box::new(Explode::new(delimiter.clone(), *limit))
            }
            PluginConfig::Callback { callable } => Box::new(Callback::new(*callable)),
            PluginConfig::SkipOnEmpty { method, message } => {
                Box::new(SkipOnEmpty::new(*method, message.clone()))
            }
            PluginConfig::SkipRowIfNotSet { index, message } => {
                if index.is_empty() {
                    return Err(MigrateError::Config(
                        "skip_row_if_not_set requires an index".into(),
                    ));
                }
                Box::new(SkipRowIfNotSet::new(index.clone(), message.clone()))
            }
        };

        let stage = Stage::new(plugin);
        Ok(match &self.source {
            Some(source) => stage.with_source(source.clone()),
            None => stage,
        })
    }
}

/// Process definition of one destination property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessEntry {
    /// `dest: source_field`
    Shorthand(String),
    Stages(Vec<StageConfig>),
    Stage(StageConfig),
}

impl ProcessEntry {
    pub fn build(&self) -> Result<Vec<Stage>> {
        match self {
            ProcessEntry::Shorthand(source) => Ok(vec![Stage::get(source.clone())]),
            ProcessEntry::Stage(stage) => Ok(vec![stage.build()?]),
            ProcessEntry::Stages(stages) => {
                if stages.is_empty() {
                    return Err(MigrateError::Config("empty process list".into()));
                }
                stages.iter().map(StageConfig::build).collect()
            }
        }
    }
}

/// The `process:` section, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessConfig(pub Vec<(String, ProcessEntry)>);

impl ProcessConfig {
    pub fn entries(&self) -> &[(String, ProcessEntry)] {
        &self.0
    }

    pub fn build(&self) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new();
        for (property, entry) in &self.0 {
            let stages = entry.build().map_err(|e| match e {
                MigrateError::Config(msg) => {
                    MigrateError::Config(format!("process.{}: {}", property, msg))
                }
                other => other,
            })?;
            pipeline.add(property.clone(), stages);
        }
        Ok(pipeline)
    }
}

impl Serialize for ProcessConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (property, entry) in &self.0 {
            map.serialize_entry(property, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProcessConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = ProcessConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of destination property to process definition")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((property, entry)) = access.next_entry::<String, ProcessEntry>()? {
                    entries.push((property, entry));
                }
                Ok(ProcessConfig(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Scalar map key as written in YAML (`1:`, `true:`, `en:`).
#[derive(Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
enum ScalarKey {
    Int(i64),
    Bool(bool),
    Str(String),
}

fn string_keys<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Map<String, Value>, D::Error> {
    let raw = BTreeMap::<ScalarKey, Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let key = match k {
                ScalarKey::Int(i) => i.to_string(),
                ScalarKey::Bool(b) => b.to_string(),
                ScalarKey::Str(s) => s,
            };
            (key, v)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_declaration_order() {
        let yaml = r#"
zeta: a
alpha:
  plugin: default_value
  source: b
  default_value: 3
mid:
  - plugin: explode
    source: tags
    delimiter: ","
  - plugin: callback
    callable: trim
"#;
        let config: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<&str> = config.entries().iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(config.0[0].1, ProcessEntry::Shorthand("a".into()));
        match &config.0[1].1 {
            ProcessEntry::Stage(stage) => {
                assert_eq!(stage.source, Some(SourceSpec::One("b".into())));
                assert!(matches!(stage.plugin, PluginConfig::DefaultValue { .. }));
            }
            other => panic!("unexpected entry: {:?}", other),
        }

        let pipeline = config.build().unwrap();
        assert_eq!(pipeline.properties().collect::<Vec<_>>(), names);
    }

    #[test]
    fn test_static_map_accepts_scalar_keys() {
        let yaml = r#"
status:
  plugin: static_map
  source: state
  map:
    1: active
    0: blocked
    x: unknown
"#;
        let config: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
        match &config.0[0].1 {
            ProcessEntry::Stage(StageConfig {
                plugin: PluginConfig::StaticMap { map, .. },
                ..
            }) => {
                assert_eq!(map.get("1"), Some(&Value::from("active")));
                assert_eq!(map.get("x"), Some(&Value::from("unknown")));
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_build_rejects_bad_settings() {
        let yaml = r#"
tags:
  plugin: explode
  source: tags
  delimiter: ""
"#;
        let config: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.build().unwrap_err().to_string();
        assert!(err.contains("process.tags"));

        let get_without_source: ProcessConfig =
            serde_yaml::from_str("x:\n  plugin: get\n").unwrap();
        assert!(get_without_source.build().is_err());
    }
}
