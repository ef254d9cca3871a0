//! Shared library resolution through `ldd`

use super::{is_elf, CacheKind, DependencySet, Layout, ResolverContext};
use crate::pool;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

impl ResolverContext {
    /// Resolve a library entity to the shared objects it needs.
    ///
    /// The entity may be a file, a glob (expanded inside its directory or the
    /// library root), or a directory whose top-level executables are
    /// resolved and which is itself recorded for a direct mount. Failures for
    /// individual files only shrink the result.
    pub async fn resolve_library(self: &Arc<Self>, entity: &str) -> DependencySet {
        if let Some(cached) = self.cache.load(CacheKind::Library, entity).await {
            return cached;
        }

        let mut directory = None;
        let files = if entity.contains('*') {
            let expanded = self
                .pool
                .run(self.tools.wildcard(entity, &self.layout.lib_dir(), &[]))
                .await;
            expanded.unwrap_or_else(|e| {
                warn!("Failed to expand {}: {}", entity, e);
                BTreeSet::new()
            })
        } else if Path::new(entity).is_dir() {
            self.add_directory(entity);
            directory = Some(entity.to_string());
            self.pool
                .run(self.tools.list_directory(entity))
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to list {}: {}", entity, e);
                    BTreeSet::new()
                })
        } else {
            BTreeSet::from([entity.to_string()])
        };

        let handles: Vec<_> = files
            .into_iter()
            .map(|file| {
                let ctx = Arc::clone(self);
                let directory = directory.clone();
                self.pool
                    .submit(async move { ctx.library_file(&file, directory.as_deref()).await })
            })
            .collect();

        let mut closure = DependencySet::new();
        for handle in handles {
            match pool::join(handle).await {
                Ok(found) => closure.extend(found),
                Err(e) => warn!("Library task failed for {}: {}", entity, e),
            }
        }

        self.cache.store(CacheKind::Library, entity, &closure).await;
        closure
    }

    /// Resolve one concrete file, through its own cache entry.
    ///
    /// The entry holds the file's full closure. Inside a directory that is
    /// mounted whole, whatever the mount already provides is dropped.
    async fn library_file(&self, file: &str, directory: Option<&str>) -> DependencySet {
        let closure = match self.cache.load(CacheKind::Library, file).await {
            Some(cached) => cached,
            None => {
                if !is_elf(file).await {
                    return DependencySet::new();
                }
                let output = match self.pool.run(self.tools.ldd(file)).await {
                    Ok(output) => output,
                    Err(e) => {
                        debug!("ldd failed for {}: {}", file, e);
                        return DependencySet::new();
                    }
                };
                let found: DependencySet = parse_ldd(&output, file, &self.layout)
                    .into_iter()
                    .filter(|path| Path::new(path).exists())
                    .collect();
                self.cache.store(CacheKind::Library, file, &found).await;
                found
            }
        };

        match directory {
            Some(dir) => outside(closure, dir),
            None => closure,
        }
    }
}

/// Extract candidate library paths from `ldd` output for `file`.
///
/// The file itself is included when it lives under a `/lib/` path.
pub fn parse_ldd(output: &str, file: &str, layout: &Layout) -> DependencySet {
    let mut found = DependencySet::new();

    if layout.sandbox_path(file).contains("/lib/") {
        found.insert(layout.normalize_library(file));
    }
    found.extend(
        output
            .split_whitespace()
            .filter(|t| t.starts_with('/'))
            .map(|token| layout.normalize_library(token)),
    );
    found
}

/// The entries of `closure` not provided by a mount of `dir`.
fn outside(closure: DependencySet, dir: &str) -> DependencySet {
    closure
        .into_iter()
        .filter(|path| !path.starts_with(dir))
        .collect()
}
