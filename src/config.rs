//! Configuration Module
//!
//! Settings for the upload engine and the soak host, read from TOML.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::backend::Capabilities;
use crate::software::SoftwareConfig;

/// Engine and host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Fence slots in the completion tracker
    #[serde(default = "default_fence_pool_size")]
    pub fence_pool_size: usize,

    /// Busy-wait iterations before a producer yields while waiting for its
    /// ticket
    #[serde(default = "default_schedule_spin_limit")]
    pub schedule_spin_limit: u32,

    /// Default tracing filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capability override; when absent the device reports its own
    #[serde(default)]
    pub capabilities: Option<Capabilities>,

    /// Emulated driver behaviour for the software device
    #[serde(default)]
    pub software: SoftwareConfig,

    /// Streaming soak loop settings
    #[serde(default)]
    pub soak: SoakConfig,
}

/// Soak loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoakConfig {
    /// Frames to run (0 = until Ctrl+C)
    #[serde(default = "default_frames")]
    pub frames: u64,

    /// Size of the streaming vertex pool in bytes
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Fragmentation weight (bytes) that starts a defrag
    #[serde(default = "default_defrag_threshold")]
    pub defrag_threshold: u32,

    /// Largest single pool allocation in bytes
    #[serde(default = "default_max_allocation")]
    pub max_allocation: u32,

    /// Frames the emulated GPU lags behind the CPU
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u64,

    /// Seed for the allocation pattern
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_fence_pool_size() -> usize {
    32
}

fn default_schedule_spin_limit() -> u32 {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frames() -> u64 {
    600
}

fn default_pool_size() -> u32 {
    1024 * 1024
}

fn default_defrag_threshold() -> u32 {
    20 * 1024
}

fn default_max_allocation() -> u32 {
    16 * 1024
}

fn default_frames_in_flight() -> u64 {
    2
}

fn default_seed() -> u64 {
    0x5eed
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            pool_size: default_pool_size(),
            defrag_threshold: default_defrag_threshold(),
            max_allocation: default_max_allocation(),
            frames_in_flight: default_frames_in_flight(),
            seed: default_seed(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fence_pool_size: default_fence_pool_size(),
            schedule_spin_limit: default_schedule_spin_limit(),
            log_level: default_log_level(),
            capabilities: None,
            software: SoftwareConfig::default(),
            soak: SoakConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.fence_pool_size, 32);
        assert_eq!(config.soak.defrag_threshold, 20 * 1024);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"

            [software]
            immediate = false
            driver_command_lists = false

            [soak]
            frames = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(!config.software.immediate);
        assert!(config.software.region_copy_reliable);
        assert_eq!(config.soak.frames, 10);
        assert_eq!(config.soak.pool_size, default_pool_size());
        assert!(config.capabilities.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploads.toml");
        let mut config = Config::default();
        config.fence_pool_size = 8;
        config.capabilities = Some(Capabilities {
            use_map_based_defrag: true,
            ..Default::default()
        });
        config.software.memory_budget = Some(64 * 1024 * 1024);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("absent.toml")).is_err());
    }
}
