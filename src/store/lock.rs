//! Cross-process lock on an application's store directory
//!
//! The lock is a file created exclusively inside the directory and holding
//! the owner's PID. Waiters block on a filesystem watch until it disappears,
//! and break locks left behind by processes that no longer exist.

use crate::error::{SbError, SbResult};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = "sb.lock";

/// Upper bound on a single wait, after which the lock is re-examined
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Held lock; the file is removed when this is dropped
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    pub async fn acquire(dir: &Path) -> SbResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SbError::io(format!("creating store directory {}", dir.display()), e))?;
        let path = dir.join(LOCK_FILE);

        loop {
            match Self::try_create(&path).await {
                Ok(()) => {
                    debug!("Acquired {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(SbError::StoreLock {
                        path,
                        reason: e.to_string(),
                    })
                }
            }

            if Self::is_stale(&path).await {
                warn!("Removing stale lock {}", path.display());
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(SbError::StoreLock {
                            path,
                            reason: e.to_string(),
                        });
                    }
                }
                continue;
            }

            info!("Another instance is writing to the store. Waiting...");
            Self::wait_for_release(&path).await?;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn try_create(path: &Path) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(std::process::id().to_string().as_bytes())
            .await?;
        file.flush().await
    }

    /// A lock is stale when its recorded owner is no longer running.
    async fn is_stale(path: &Path) -> bool {
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            return false;
        };
        match content.trim().parse::<u32>() {
            Ok(pid) => !Path::new("/proc").join(pid.to_string()).exists(),
            // Still being written by its owner
            Err(_) => false,
        }
    }

    /// Block until the lock file is removed or the poll interval passes.
    async fn wait_for_release(path: &Path) -> SbResult<()> {
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let _ = tx.send(result);
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        // The owner may have finished before the watch was in place
        if !path.exists() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + POLL_INTERVAL;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Ok(event))) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path.file_name());
                    if ours && matches!(event.kind, EventKind::Remove(_)) {
                        return Ok(());
                    }
                }
                Ok(Some(Err(e))) => {
                    debug!("Watch error on {}: {}", dir.display(), e);
                    return Ok(());
                }
                Ok(None) | Err(_) => return Ok(()),
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to release {}: {}", self.path.display(), e);
            }
        }
    }
}
