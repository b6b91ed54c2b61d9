//! Runtime configuration: storage backend, heuristic choice, backing file
//! paths, and battery parameters. Deserializes from a config file and/or
//! flattens onto a CLI. `STORAGE_MODE`/`HEURISTIC` environment variables take
//! precedence over both once applied, matching the reference process's own
//! override order.

use serde::{Deserialize, Serialize};

use crate::battery::BatteryParams;
use crate::heuristic::HeuristicKind;
use crate::model::StorageMode;

fn default_queue_dir() -> String {
    "/usr/share/dipp".to_string()
}

fn default_cache_path() -> String {
    "/usr/share/dipp/cost.cache".to_string()
}

fn default_cleanup_after_upload() -> bool {
    false
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct DippConfig {
    #[serde(default)]
    #[cfg_attr(feature = "cli", arg(long, value_enum, default_value_t = StorageModeArg::Mmap))]
    pub storage_mode: StorageModeArg,

    #[serde(default)]
    #[cfg_attr(feature = "cli", arg(long, value_enum, default_value_t = HeuristicArg::BestEffort))]
    pub heuristic: HeuristicArg,

    #[serde(default = "default_queue_dir")]
    #[cfg_attr(feature = "cli", arg(long, default_value = "/usr/share/dipp"))]
    pub queue_dir: String,

    #[serde(default = "default_cache_path")]
    #[cfg_attr(feature = "cli", arg(long, default_value = "/usr/share/dipp/cost.cache"))]
    pub cache_path: String,

    #[serde(default = "default_cleanup_after_upload")]
    #[cfg_attr(feature = "cli", arg(long, default_value_t = false))]
    pub cleanup_after_upload: bool,
}

impl Default for DippConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageModeArg::Mmap,
            heuristic: HeuristicArg::BestEffort,
            queue_dir: default_queue_dir(),
            cache_path: default_cache_path(),
            cleanup_after_upload: default_cleanup_after_upload(),
        }
    }
}

impl DippConfig {
    pub fn ingest_queue_path(&self) -> String {
        format!("{}/queue_file", self.queue_dir)
    }

    pub fn partial_queue_path(&self) -> String {
        format!("{}/partially_processed_queue_file", self.queue_dir)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode.into()
    }

    pub fn heuristic_kind(&self) -> HeuristicKind {
        self.heuristic.into()
    }

    pub fn battery_params(&self) -> BatteryParams {
        BatteryParams::default()
    }

    /// Applies `STORAGE_MODE`/`HEURISTIC` environment variable overrides on
    /// top of whatever was resolved from a config file or CLI flags.
    /// Unknown values fall back to the same defaults the reference process
    /// used (MMAP, BEST_EFFORT) and are logged, not rejected.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("STORAGE_MODE") {
            self.storage_mode = match mode.as_str() {
                "MEM" => StorageModeArg::Mem,
                "MMAP" => StorageModeArg::Mmap,
                other => {
                    tracing::warn!(value = other, "unknown STORAGE_MODE, defaulting to MMAP");
                    StorageModeArg::Mmap
                }
            };
        }

        if let Ok(heuristic) = std::env::var("HEURISTIC") {
            self.heuristic = match heuristic.as_str() {
                "LOWEST_EFFORT" => HeuristicArg::LowestEffort,
                "BEST_EFFORT" => HeuristicArg::BestEffort,
                other => {
                    tracing::warn!(value = other, "unknown HEURISTIC, defaulting to BEST_EFFORT");
                    HeuristicArg::BestEffort
                }
            };
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum StorageModeArg {
    #[default]
    Mmap,
    Mem,
}

impl From<StorageModeArg> for StorageMode {
    fn from(value: StorageModeArg) -> Self {
        match value {
            StorageModeArg::Mmap => StorageMode::Mmap,
            StorageModeArg::Mem => StorageMode::Mem,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum HeuristicArg {
    #[default]
    BestEffort,
    LowestEffort,
}

impl From<HeuristicArg> for HeuristicKind {
    fn from(value: HeuristicArg) -> Self {
        match value {
            HeuristicArg::BestEffort => HeuristicKind::BestEffort,
            HeuristicArg::LowestEffort => HeuristicKind::LowestEffort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_process_defaults() {
        let config = DippConfig::default();
        assert_eq!(config.storage_mode(), StorageMode::Mmap);
        assert_eq!(config.heuristic_kind(), HeuristicKind::BestEffort);
        assert!(!config.cleanup_after_upload);
    }
}
