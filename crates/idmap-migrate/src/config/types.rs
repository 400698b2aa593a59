//! Configuration type definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::destination::DestinationConfig;
use crate::process::ProcessConfig;
use crate::source::SourceConfig;

/// System resource information used to resolve the memory ceiling.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Id map storage.
    pub id_map: IdMapConfig,

    /// Resource budgets and progress reporting.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Migration definitions.
    pub migrations: Vec<MigrationDefinition>,

    /// Directory relative paths resolve against; set by [`Config::load`].
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Id map database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdMapConfig {
    /// SQLite database file holding map, message, and high-water tables.
    pub path: PathBuf,
}

/// Budget settings. Unset values fall back to system-derived defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Memory ceiling in MB. Defaults to total system memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,

    /// Fraction of the ceiling that triggers a reclaim (default: 0.85).
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,

    /// Post-reclaim threshold as a fraction of `memory_threshold` (default: 0.90).
    #[serde(default = "default_reclaim_ratio")]
    pub memory_reclaim_ratio: f64,

    /// Wall-clock budget per run in seconds. Unlimited if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_secs: Option<u64>,

    /// Fraction of `max_execution_secs` after which a run yields (default: 0.90).
    #[serde(default = "default_time_threshold")]
    pub time_threshold: f64,

    /// Progress message every N processed rows. Off if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_every: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: None,
            memory_threshold: default_memory_threshold(),
            memory_reclaim_ratio: default_reclaim_ratio(),
            max_execution_secs: None,
            time_threshold: default_time_threshold(),
            feedback_every: None,
        }
    }
}

/// One migration: where records come from, how they are transformed, and
/// where they go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDefinition {
    /// Unique migration id; also names the id map tables.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub source: SourceConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    pub destination: DestinationConfig,

    /// Record the import time of each mapping (default: false).
    #[serde(default)]
    pub track_last_imported: bool,
}

fn default_memory_threshold() -> f64 {
    0.85
}

fn default_reclaim_ratio() -> f64 {
    0.90
}

fn default_time_threshold() -> f64 {
    0.90
}
