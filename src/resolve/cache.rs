//! Per-entity resolution cache
//!
//! One file per resolved entity, named after the entity path with `/`
//! replaced by `.` and globs dropped, holding the entity's dependency set on
//! a single line. A missing, unreadable, or empty file is a miss.

use super::{lock, DependencySet};
use crate::util;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Library,
    Binary,
}

impl CacheKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Library => ".lib.cache",
            Self::Binary => ".bin.cache",
        }
    }
}

pub struct ResolutionCache {
    dir: Option<PathBuf>,
    /// Delete each entry the first time it is looked up in this run
    refresh: bool,
    invalidated: Mutex<HashSet<PathBuf>>,
}

impl ResolutionCache {
    pub fn new(dir: impl Into<PathBuf>, refresh: bool) -> Self {
        Self {
            dir: Some(dir.into()),
            refresh,
            invalidated: Mutex::new(HashSet::new()),
        }
    }

    /// A cache that never hits and never writes.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            refresh: false,
            invalidated: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self, kind: CacheKind, entity: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        Some(dir.join(format!("{}{}", util::cache_name(entity), kind.suffix())))
    }

    pub async fn load(&self, kind: CacheKind, entity: &str) -> Option<DependencySet> {
        let path = self.path(kind, entity)?;

        if self.refresh && lock(&self.invalidated).insert(path.clone()) {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Invalidated cache {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove cache {}: {}", path.display(), e),
            }
            return None;
        }

        let text = fs::read_to_string(&path).await.ok()?;
        let set = DependencySet::parse(&text);
        if set.is_empty() {
            return None;
        }
        debug!("Cache hit for {}", entity);
        Some(set)
    }

    /// Persist a non-empty result. Failures only cost a future cache miss.
    pub async fn store(&self, kind: CacheKind, entity: &str, set: &DependencySet) {
        if set.is_empty() {
            return;
        }
        let Some(path) = self.path(kind, entity) else {
            return;
        };
        let Some(dir) = path.parent() else {
            return;
        };

        if let Err(e) = fs::create_dir_all(dir).await {
            warn!("Failed to create cache directory {}: {}", dir.display(), e);
            return;
        }

        // Write beside the target and rename so readers never see a partial file
        let staging = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let result = match fs::write(&staging, set.to_line()).await {
            Ok(()) => fs::rename(&staging, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to write cache {}: {}", path.display(), e);
            let _ = fs::remove_file(&staging).await;
        }
    }
}
