//! Builds runnable migrations from configuration.
//!
//! The [`MigrationCatalog`] owns a validated [`Config`] and turns a
//! migration id into its collaborators: source, pipeline, destination, id
//! map, and budget. Plugins are selected by the serde-tagged config enums,
//! so there is no global plugin registry.

use std::sync::Arc;

use tracing::debug;

use crate::config::{Config, MigrationDefinition, SystemResources};
use crate::error::Result;
use crate::executable::{Budget, Limits, MigrateExecutable, Migration, RunOptions};
use crate::id_map::SqlIdMap;
use crate::message::MessageSink;

/// Registry of the migrations defined in one configuration.
pub struct MigrationCatalog {
    config: Config,
    resources: SystemResources,
}

impl MigrationCatalog {
    pub fn new(config: Config) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        Self { config, resources }
    }

    /// Catalog with fixed system resources instead of detected ones.
    pub fn with_resources(config: Config, resources: SystemResources) -> Self {
        Self { config, resources }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ids(&self) -> Vec<&str> {
        self.config.migration_ids()
    }

    pub fn definition(&self, id: &str) -> Result<&MigrationDefinition> {
        self.config.migration(id)
    }

    /// Instantiate the source, pipeline, and destination of a migration.
    pub fn migration(&self, id: &str) -> Result<Migration> {
        let definition = self.definition(id)?;
        let base_dir = self.config.base_dir.as_deref();

        let destination_ids = &definition.destination.ids;
        let source = definition.source.build(destination_ids, base_dir)?;
        let pipeline = definition.process.build()?;
        let destination = definition
            .destination
            .build(&self.config.id_map_path(), base_dir)?;

        debug!(
            "Built migration {}: {} -> {} ({} properties)",
            id,
            definition.source.plugin_name(),
            definition.destination.plugin_name(),
            pipeline.len()
        );

        let migration = Migration::new(definition.id.clone(), source, pipeline, destination);
        Ok(match &definition.label {
            Some(label) => migration.with_label(label.clone()),
            None => migration,
        })
    }

    /// Open the id map of a migration.
    pub fn id_map(&self, id: &str) -> Result<SqlIdMap> {
        let definition = self.definition(id)?;
        let id_map = SqlIdMap::open(
            self.config.id_map_path(),
            &definition.id,
            definition.source.ids.clone(),
            definition.destination.ids.clone(),
        )?;
        Ok(id_map.with_track_last_imported(definition.track_last_imported))
    }

    pub fn limits(&self) -> Limits {
        Limits::resolve(&self.config.limits, &self.resources)
    }

    /// Everything needed to import or roll back one migration.
    pub fn executable(
        &self,
        id: &str,
        sink: Arc<dyn MessageSink>,
        mut options: RunOptions,
    ) -> Result<MigrateExecutable> {
        let migration = self.migration(id)?;
        let id_map = self.id_map(id)?;
        if options.feedback_every.is_none() {
            options.feedback_every = self.config.limits.feedback_every;
        }

        Ok(
            MigrateExecutable::new(migration, Box::new(id_map), sink, Budget::system(self.limits()))
                .with_options(options),
        )
    }
}
