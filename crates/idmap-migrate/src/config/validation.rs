//! Configuration validation.

use std::collections::HashMap;

use super::Config;
use crate::core::identifier::{map_table_name, validate_identifier};
use crate::destination::DestinationPluginConfig;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.id_map.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("id_map.path is required".into()));
    }

    // Limits validation
    let limits = &config.limits;
    for (name, value) in [
        ("memory_threshold", limits.memory_threshold),
        ("memory_reclaim_ratio", limits.memory_reclaim_ratio),
        ("time_threshold", limits.time_threshold),
    ] {
        if !(value > 0.0 && value <= 1.0) {
            return Err(MigrateError::Config(format!(
                "limits.{} must be in (0, 1], got {}",
                name, value
            )));
        }
    }
    if let Some(0) = limits.memory_limit_mb {
        return Err(MigrateError::Config(
            "limits.memory_limit_mb must be at least 1".into(),
        ));
    }
    if let Some(0) = limits.feedback_every {
        return Err(MigrateError::Config(
            "limits.feedback_every must be at least 1".into(),
        ));
    }

    if config.migrations.is_empty() {
        return Err(MigrateError::Config(
            "at least one migration is required".into(),
        ));
    }

    // Migration ids must stay distinct after table-name sanitizing.
    let mut tables: HashMap<String, &str> = HashMap::new();
    for migration in &config.migrations {
        if migration.id.trim().is_empty() {
            return Err(MigrateError::Config("migration id is required".into()));
        }
        if let Some(other) = tables.insert(map_table_name(&migration.id), &migration.id) {
            return Err(MigrateError::Config(format!(
                "migrations '{}' and '{}' share the same id map tables",
                other, migration.id
            )));
        }

        let context = |e: MigrateError| match e {
            MigrateError::Config(msg) => {
                MigrateError::Config(format!("migration '{}': {}", migration.id, msg))
            }
            other => other,
        };

        migration.source.ids.validate("source.ids").map_err(context)?;
        migration
            .destination
            .ids
            .validate("destination.ids")
            .map_err(context)?;
        if let Some(property) = &migration.source.high_water_property {
            if property.is_empty() {
                return Err(context(MigrateError::Config(
                    "source.high_water_property cannot be empty".into(),
                )));
            }
        }
        match &migration.destination.plugin {
            DestinationPluginConfig::Table { table, .. } => {
                validate_identifier(table).map_err(context)?;
            }
        }
        migration.process.build().map_err(context)?;
    }

    Ok(())
}
