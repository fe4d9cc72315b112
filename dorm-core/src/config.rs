//! Tracker configuration
//!
//! Defaults for new scopes, stored as JSON next to the application's other
//! settings. Missing files and missing fields fall back to defaults.

use crate::backend::IsolationLevel;
use crate::codec::{Compression, SnapshotCodec};
use crate::scope::ChangeTrackingMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default file name used by [`TrackerConfig::load_from_dir`]
pub const CONFIG_FILE: &str = "tracker-config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Mode of scopes that do not choose one
    #[serde(default)]
    pub default_mode: ChangeTrackingMode,
    /// Commit automatically when a scope ends normally
    #[serde(default)]
    pub auto_commit: bool,
    /// Isolation level of the ambient transaction
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Snapshot compression
    #[serde(default)]
    pub compression: Compression,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Enlist scopes without their own connection in a shared transaction
    #[serde(default = "default_ambient_transactions")]
    pub ambient_transactions: bool,
}

fn default_compression_level() -> i32 {
    3
}

fn default_ambient_transactions() -> bool {
    true
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_mode: ChangeTrackingMode::default(),
            auto_commit: false,
            isolation_level: IsolationLevel::default(),
            compression: Compression::default(),
            compression_level: default_compression_level(),
            ambient_transactions: default_ambient_transactions(),
        }
    }
}

impl TrackerConfig {
    /// Load from a JSON file, defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tracker config from {:?}", path))?;
        let config: TrackerConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse tracker config JSON")?;
        Ok(config)
    }

    /// Load `tracker-config.json` from `dir`
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load(&dir.join(CONFIG_FILE))
    }

    /// Write to `path` through a temporary file
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)
            .with_context(|| format!("Failed to write tracker config to {:?}", tmp_path))?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Snapshot codec for these settings
    pub fn codec(&self) -> SnapshotCodec {
        SnapshotCodec::new(self.compression, self.compression_level)
    }
}
