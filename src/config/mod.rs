//! The sb configuration file

pub mod schema;

pub use schema::Config;

use crate::error::{SbError, SbResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Locates, reads and writes `config.toml`
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// `$XDG_CONFIG_HOME/sb/config.toml`
    pub fn new() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_path(base.join("sb").join("config.toml"))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Read and check the file; a missing file means built-in defaults.
    pub async fn load(&self) -> SbResult<Config> {
        let path = &self.config_path;
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(SbError::io(format!("reading config from {}", path.display()), e))
            }
        };

        let config: Config = toml::from_str(&content).map_err(|e| self.invalid(e))?;
        check(&config).map_err(|reason| self.invalid(reason))?;
        Ok(config)
    }

    /// Write `config`, creating the parent directory.
    pub async fn save(&self, config: &Config) -> SbResult<()> {
        let path = &self.config_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SbError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        fs::write(path, toml::to_string_pretty(config)?)
            .await
            .map_err(|e| SbError::io(format!("writing config to {}", path.display()), e))?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    fn invalid(&self, reason: impl ToString) -> SbError {
        SbError::ConfigInvalid {
            path: self.config_path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Values serde accepts but sb cannot use.
fn check(config: &Config) -> Result<(), String> {
    let store = config.paths.store.as_str();
    if !matches!(store, "tmp" | "data" | "zram") && !store.starts_with('/') {
        return Err(format!(
            "paths.store must be tmp, data, zram or an absolute path, not '{store}'"
        ));
    }
    if !matches!(config.general.log_format.as_str(), "text" | "json") {
        return Err(format!(
            "general.log_format must be text or json, not '{}'",
            config.general.log_format
        ));
    }
    if config.tools.timeout_secs == 0 {
        return Err("tools.timeout_secs must be at least 1".to_string());
    }
    Ok(())
}
