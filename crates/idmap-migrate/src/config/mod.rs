//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Relative paths inside the file resolve against its directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a migration definition by id.
    pub fn migration(&self, id: &str) -> Result<&MigrationDefinition> {
        self.migrations
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| MigrateError::Config(format!("Unknown migration: {}", id)))
    }

    pub fn migration_ids(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.id.as_str()).collect()
    }

    /// Resolve a configured path against the config file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Id map database file.
    pub fn id_map_path(&self) -> PathBuf {
        self.resolve_path(&self.id_map.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
id_map:
  path: migrate.db
limits:
  memory_limit_mb: 512
  feedback_every: 100
migrations:
  - id: users
    label: Users
    source:
      plugin: embedded_data
      ids: [{ name: id, type: integer }]
      track_changes: true
      data_rows:
        - { id: 1, name: ada }
    process:
      name: name
    destination:
      plugin: table
      table: users
      ids: [{ name: uid, type: integer }]
"#;

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.migration_ids(), vec!["users"]);
        assert_eq!(config.limits.memory_limit_mb, Some(512));
        assert_eq!(config.limits.memory_threshold, 0.85);
        assert_eq!(config.limits.memory_reclaim_ratio, 0.90);
        assert!(config.migration("users").unwrap().source.track_changes);
        assert!(config.migration("nope").is_err());
    }

    #[test]
    fn test_load_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrate.yaml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(YAML.as_bytes())
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.id_map_path(), dir.path().join("migrate.db"));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(YAML).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }
}
