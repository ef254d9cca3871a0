//! Per-application caches: the library closure and the generated command
//!
//! Both files start with the fingerprint of the options that produced them,
//! followed by a newline and the payload.

use crate::error::{SbError, SbResult};
use crate::resolve::DependencySet;
use crate::util;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const CLOSURE_FILE: &str = "lib.cache";
pub const COMMAND_FILE: &str = "cmd.cache";

#[derive(Debug, Clone)]
pub struct AppCache {
    dir: PathBuf,
}

impl AppCache {
    /// Caches for `app` under `<data_dir>/apps/<app>`.
    pub fn new(data_dir: &Path, app: &str) -> Self {
        Self {
            dir: Self::apps_dir(data_dir).join(app),
        }
    }

    pub fn apps_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("apps")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn closure_path(&self) -> PathBuf {
        self.dir.join(CLOSURE_FILE)
    }

    pub fn command_path(&self) -> PathBuf {
        self.dir.join(COMMAND_FILE)
    }

    /// Fingerprint and trimmed closure from the last store population.
    pub async fn load_closure(&self) -> Option<(String, DependencySet)> {
        let (fingerprint, payload) = read_split(&self.closure_path()).await?;
        Some((fingerprint, DependencySet::parse(&payload)))
    }

    pub async fn save_closure(&self, fingerprint: &str, closure: &DependencySet) -> SbResult<()> {
        write(&self.closure_path(), fingerprint, &closure.to_line()).await
    }

    /// Fingerprint and tokens of the last generated command.
    pub async fn load_command(&self) -> Option<(String, Vec<String>)> {
        let (fingerprint, payload) = read_split(&self.command_path()).await?;
        let Some(tokens) = shlex::split(&payload) else {
            debug!("Unparseable command cache {}", self.command_path().display());
            return None;
        };
        Some((fingerprint, tokens))
    }

    pub async fn save_command(&self, fingerprint: &str, tokens: &[String]) -> SbResult<()> {
        write(&self.command_path(), fingerprint, &util::render_command(tokens)).await
    }
}

async fn read_split(path: &Path) -> Option<(String, String)> {
    let text = fs::read_to_string(path).await.ok()?;
    let (fingerprint, payload) = text.split_once('\n')?;
    let fingerprint = fingerprint.trim();
    if fingerprint.is_empty() {
        return None;
    }
    Some((fingerprint.to_string(), payload.trim().to_string()))
}

async fn write(path: &Path, fingerprint: &str, payload: &str) -> SbResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SbError::Internal(format!("cache path {} has no parent", path.display())))?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| SbError::io(format!("creating cache directory {}", dir.display()), e))?;

    let staging = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&staging, format!("{fingerprint}\n{payload}"))
        .await
        .map_err(|e| SbError::io(format!("writing {}", staging.display()), e))?;
    fs::rename(&staging, path)
        .await
        .map_err(|e| SbError::io(format!("replacing {}", path.display()), e))
}
