//! Configuration Module
//!
//! Every configuration key the checkpoint engine recognizes, with the
//! defaults of the surrounding server. Configurations load from YAML files
//! and validate before an engine is built around them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::throttle::BandwidthThrottler;

/// Default checkpoint period: one hour.
pub const DEFAULT_CHECKPOINT_PERIOD_SECS: u64 = 3600;

/// Default edit-log size that triggers a checkpoint: 4 MiB.
pub const DEFAULT_CHECKPOINT_SIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Errors raised while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration of the checkpoint engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directories holding namespace images.
    pub image_dirs: Vec<PathBuf>,
    /// Directories holding edit journals. A path in both lists serves both
    /// roles.
    pub edits_dirs: Vec<PathBuf>,
    /// Source image directories for an import startup.
    pub checkpoint_dirs: Vec<PathBuf>,
    /// Source edits directories for an import startup.
    pub checkpoint_edits_dirs: Vec<PathBuf>,
    /// Whether saved images are compressed.
    pub compress_image: bool,
    /// Registered codec name; required when compression is on.
    pub compression_codec: Option<String>,
    /// Whether a save is forced right after startup.
    pub save_on_start: bool,
    /// Bytes per second granted to the external image transfer pipe;
    /// 0 disables throttling.
    pub transfer_bandwidth_per_sec: i64,
    /// Age of the last checkpoint that triggers a re-save at startup.
    pub checkpoint_period_secs: u64,
    /// Edit-log length that triggers a re-save at startup.
    pub checkpoint_size_bytes: u64,
    /// Whether evicted storage directories are retried once writable again.
    pub restore_failed_storage: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            image_dirs: Vec::new(),
            edits_dirs: Vec::new(),
            checkpoint_dirs: Vec::new(),
            checkpoint_edits_dirs: Vec::new(),
            compress_image: false,
            compression_codec: None,
            save_on_start: false,
            transfer_bandwidth_per_sec: 0,
            checkpoint_period_secs: DEFAULT_CHECKPOINT_PERIOD_SECS,
            checkpoint_size_bytes: DEFAULT_CHECKPOINT_SIZE_BYTES,
            restore_failed_storage: false,
        }
    }
}

impl CheckpointConfig {
    pub fn new(image_dirs: Vec<PathBuf>, edits_dirs: Vec<PathBuf>) -> Self {
        Self {
            image_dirs,
            edits_dirs,
            ..Self::default()
        }
    }

    /// Load a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn with_compression<S: Into<String>>(mut self, codec: S) -> Self {
        self.compress_image = true;
        self.compression_codec = Some(codec.into());
        self
    }

    pub fn with_checkpoint_dirs(mut self, dirs: Vec<PathBuf>, edits_dirs: Vec<PathBuf>) -> Self {
        self.checkpoint_dirs = dirs;
        self.checkpoint_edits_dirs = edits_dirs;
        self
    }

    pub fn with_restore_failed_storage(mut self, restore: bool) -> Self {
        self.restore_failed_storage = restore;
        self
    }

    pub fn with_transfer_bandwidth(mut self, bytes_per_sec: i64) -> Self {
        self.transfer_bandwidth_per_sec = bytes_per_sec;
        self
    }

    /// Throttler for the external transfer pipe, when bandwidth is capped.
    pub fn transfer_throttler(&self) -> Option<BandwidthThrottler> {
        if self.transfer_bandwidth_per_sec > 0 {
            Some(BandwidthThrottler::new(self.transfer_bandwidth_per_sec as u64))
        } else {
            None
        }
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.image_dirs.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "at least one image directory must be configured".to_string(),
            });
        }
        if self.edits_dirs.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "at least one edits directory must be configured".to_string(),
            });
        }
        // The same path may appear in both lists (a BOTH directory) but not
        // twice in one list.
        let mut seen = HashSet::new();
        for dir in &self.image_dirs {
            if !seen.insert(dir) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate image directory {:?}", dir),
                });
            }
        }
        seen.clear();
        for dir in &self.edits_dirs {
            if !seen.insert(dir) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate edits directory {:?}", dir),
                });
            }
        }
        if self.compress_image && self.compression_codec.is_none() {
            return Err(ConfigError::Invalid {
                reason: "compression is enabled but no codec is named".to_string(),
            });
        }
        if self.transfer_bandwidth_per_sec < 0 {
            return Err(ConfigError::Invalid {
                reason: "transfer bandwidth must not be negative".to_string(),
            });
        }
        Ok(())
    }
}
