//! Built-in destinations.
//!
//! - **table**: a SQLite table keyed by the destination ids, with the
//!   remaining destination properties stored as a JSON document

mod table;

pub use table::TableDestination;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::schema::IdSchema;
use crate::core::traits::Destination;
use crate::error::Result;
use crate::id_map::RollbackAction;

/// Plugin selection of a migration destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plugin", rename_all = "snake_case")]
pub enum DestinationPluginConfig {
    Table {
        table: String,
        /// Database file; defaults to the id map database.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<PathBuf>,
    },
}

/// The `destination:` section of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Fields identifying a destination record.
    pub ids: IdSchema,

    #[serde(default)]
    pub rollback_action: RollbackAction,

    #[serde(flatten)]
    pub plugin: DestinationPluginConfig,
}

impl DestinationConfig {
    /// Instantiate the destination.
    pub fn build(
        &self,
        id_map_database: &Path,
        base_dir: Option<&Path>,
    ) -> Result<Box<dyn Destination>> {
        self.ids.validate("destination ids")?;
        match &self.plugin {
            DestinationPluginConfig::Table { table, database } => {
                let path = match (database, base_dir) {
                    (Some(db), Some(dir)) if db.is_relative() => dir.join(db),
                    (Some(db), _) => db.clone(),
                    (None, _) => id_map_database.to_path_buf(),
                };
                let destination = TableDestination::open(&path, table, self.ids.clone())?
                    .with_rollback_action(self.rollback_action);
                Ok(Box::new(destination))
            }
        }
    }

    pub fn plugin_name(&self) -> &'static str {
        match self.plugin {
            DestinationPluginConfig::Table { .. } => "table",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_destination() {
        let yaml = r#"
plugin: table
table: users
ids: [{ name: uid, type: integer }]
rollback_action: preserve
"#;
        let config: DestinationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rollback_action, RollbackAction::Preserve);
        assert_eq!(config.plugin_name(), "table");
        assert_eq!(
            config.plugin,
            DestinationPluginConfig::Table {
                table: "users".into(),
                database: None
            }
        );
    }
}
