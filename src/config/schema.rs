//! Configuration schema for sb
//!
//! Configuration is stored at `~/.config/sb/config.toml`

use crate::options::{Namespace, UpdateLevel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Store and cache locations
    pub paths: PathsConfig,

    /// External programs
    pub tools: ToolsConfig,

    /// Worker pool sizing
    pub pool: PoolConfig,

    /// Defaults merged into every `sb run`
    pub defaults: DefaultsConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Where the object store and caches live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Object store backing: "tmp", "data", "zram" or an absolute path
    pub store: String,

    /// Override for the cache directory (default: `$XDG_DATA_HOME/sb`)
    pub data_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store: "tmp".to_string(),
            data_dir: None,
        }
    }
}

impl PathsConfig {
    /// Directory holding cached resolutions and per-application state
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sb")
        })
    }

    /// Root of the object store
    pub fn store_root(&self) -> PathBuf {
        match self.store.as_str() {
            "tmp" => PathBuf::from("/tmp/sb"),
            "zram" => PathBuf::from("/run/sb"),
            "data" => self.data_dir().join("store"),
            other => PathBuf::from(other),
        }
    }
}

/// External tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Dynamic dependency lister
    pub ldd: String,

    /// File finder used for glob and directory expansion
    pub find: String,

    /// Sandbox launcher
    pub bwrap: String,

    /// Per-invocation timeout for ldd and find
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ldd: "ldd".to_string(),
            find: "find".to_string(),
            bwrap: "bwrap".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent leaf jobs (0 = one per CPU)
    pub workers: usize,
}

/// Defaults for `sb run`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Update level when none is given on the command line
    pub update: Option<UpdateLevel>,

    /// Library entities added to every sandbox (`path` or `path:x`)
    pub libraries: Vec<String>,

    /// Extra binaries added to every sandbox
    pub binaries: Vec<String>,

    /// Shared namespaces when none are given on the command line
    pub share: Vec<Namespace>,
}
