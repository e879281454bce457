//! capgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapgridConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the redb state file. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Fallback tracing filter when `RUST_LOG` is not set.
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds a reservation task may stay non-terminal before the
    /// supervisor forces it into ERROR.
    #[serde(default = "default_task_deadline_secs")]
    pub task_deadline_secs: u64,
    #[serde(default)]
    pub placement: PlacementWeightsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_deadline_secs: default_task_deadline_secs(),
            placement: PlacementWeightsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementWeightsConfig {
    pub bin_packing: f64,
    pub affinity: f64,
    pub balance: f64,
}

impl Default for PlacementWeightsConfig {
    fn default() -> Self {
        Self {
            bin_packing: 0.5,
            affinity: 0.3,
            balance: 0.2,
        }
    }
}

fn default_task_deadline_secs() -> u64 {
    60
}

pub const DEFAULT_LOG_FILTER: &str = "info,capgrid=debug";

impl CapgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CapgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn log_filter(&self) -> &str {
        self.daemon.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
