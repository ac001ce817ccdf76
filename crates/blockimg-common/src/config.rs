//! Configuration types for blockimg
//!
//! Every section has a `Default` so a partial TOML document only needs to
//! name the values it overrides.

use crate::error::{Error, Result};
use crate::types::Features;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration for the image control plane
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Image creation defaults
    pub image: ImageConfig,
    /// Exclusive lock and fencing
    pub lock: LockConfig,
    /// Mirroring
    pub mirroring: MirroringConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::invalid_argument(format!("failed to parse config: {e}")))
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::not_found(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

/// Defaults applied when creating images
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Format version used when the caller does not pick one
    pub default_format: u32,
    /// log2 of the object size (default: 22, 4 MiB objects)
    pub default_order: u8,
    /// Feature names enabled on new format-2 images
    pub default_features: Vec<String>,
    /// Check that a pool supports self-managed snapshots before first use
    pub validate_pool: bool,
    /// Page size used when listing the image directory
    pub directory_page_size: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            default_format: 2,
            default_order: 22,
            default_features: [
                "layering",
                "exclusive-lock",
                "object-map",
                "fast-diff",
                "deep-flatten",
                "journaling",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            validate_pool: true,
            directory_page_size: 1024,
        }
    }
}

impl ImageConfig {
    /// Resolve `default_features` into a feature set
    pub fn features(&self) -> Result<Features> {
        let mut features = Features::NONE;
        for name in &self.default_features {
            let feature = Features::from_name(name)
                .ok_or_else(|| Error::invalid_argument(format!("unknown feature: {name}")))?;
            features.insert(feature);
        }
        Ok(features)
    }
}

/// Exclusive lock settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Blacklist a lock owner's address when its lock is broken
    pub blacklist_on_break_lock: bool,
    /// Blacklist duration in seconds (0 uses the store default)
    pub blacklist_expire_seconds: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            blacklist_on_break_lock: true,
            blacklist_expire_seconds: 0,
        }
    }
}

/// Mirroring settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MirroringConfig {
    /// Name of this cluster; peers may not use it
    pub local_cluster_name: String,
}

impl Default for MirroringConfig {
    fn default() -> Self {
        Self {
            local_cluster_name: "local".to_string(),
        }
    }
}

/// Logging settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `blockimg_core=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
