//! Built-in sources and the map-aware source cursor.
//!
//! - **embedded_data**: rows listed inline in the migration definition
//! - **json_file**: an array of objects read from a JSON file
//!
//! [`SourceCursor`] wraps any [`Source`] and decides per row whether the
//! executable should process it, based on the id map.

mod cursor;
mod embedded;
mod json_file;

pub use cursor::SourceCursor;
pub use embedded::EmbeddedDataSource;
pub use json_file::JsonFileSource;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::schema::IdSchema;
use crate::core::traits::Source;
use crate::error::Result;

/// Settings shared by every source plugin.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub ids: IdSchema,
    pub destination_ids: IdSchema,
    pub high_water_property: Option<String>,
    pub track_changes: bool,
}

/// Plugin selection of a migration source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plugin", rename_all = "snake_case")]
pub enum SourcePluginConfig {
    EmbeddedData {
        data_rows: Vec<Map<String, Value>>,
    },
    JsonFile {
        path: PathBuf,
        /// `/`-separated path to the item array inside the document.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_selector: Option<String>,
    },
}

/// The `source:` section of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Fields identifying a source record.
    pub ids: IdSchema,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water_property: Option<String>,

    #[serde(default)]
    pub track_changes: bool,

    #[serde(flatten)]
    pub plugin: SourcePluginConfig,
}

impl SourceConfig {
    /// Instantiate the source. Relative file paths resolve against
    /// `base_dir` when given.
    pub fn build(
        &self,
        destination_ids: &IdSchema,
        base_dir: Option<&Path>,
    ) -> Result<Box<dyn Source>> {
        self.ids.validate("source ids")?;
        let options = SourceOptions {
            ids: self.ids.clone(),
            destination_ids: destination_ids.clone(),
            high_water_property: self.high_water_property.clone(),
            track_changes: self.track_changes,
        };

        Ok(match &self.plugin {
            SourcePluginConfig::EmbeddedData { data_rows } => {
                Box::new(EmbeddedDataSource::new(data_rows.clone(), options))
            }
            SourcePluginConfig::JsonFile {
                path,
                item_selector,
            } => {
                let path = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path.clone(),
                };
                Box::new(JsonFileSource::new(path, item_selector.clone(), options))
            }
        })
    }

    pub fn plugin_name(&self) -> &'static str {
        match self.plugin {
            SourcePluginConfig::EmbeddedData { .. } => "embedded_data",
            SourcePluginConfig::JsonFile { .. } => "json_file",
        }
    }
}
