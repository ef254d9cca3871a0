//! Dependency resolution
//!
//! Computes the closure of binaries and shared libraries a program needs.
//! Binaries are classified by their header: ELF files go to `ldd`, scripts
//! are scanned for the interpreter and the commands they invoke. Results for
//! each entity are cached on disk under [`ResolutionCache`].

pub mod binaries;
pub mod cache;
pub mod libraries;
pub mod script;

pub use cache::{CacheKind, ResolutionCache};

use crate::exec::Tools;
use crate::pool::WorkerPool;
use std::collections::{btree_set, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Ordered set of absolute paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet(BTreeSet<String>);

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse whitespace-separated paths, as written by [`DependencySet::to_line`].
    pub fn parse(text: &str) -> Self {
        text.split_whitespace().map(str::to_string).collect()
    }

    pub fn to_line(&self) -> String {
        self.0.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }

    pub fn insert(&mut self, path: impl Into<String>) -> bool {
        self.0.insert(path.into())
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.0.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }

    /// Entries of `self` not present in `other`.
    pub fn difference(&self, other: &DependencySet) -> DependencySet {
        self.0.difference(&other.0).cloned().collect()
    }
}

impl FromIterator<String> for DependencySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<String> for DependencySet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for DependencySet {
    type Item = String;
    type IntoIter = btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DependencySet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<const N: usize> From<[&str; N]> for DependencySet {
    fn from(paths: [&str; N]) -> Self {
        paths.iter().map(|p| p.to_string()).collect()
    }
}

/// Maps host-style paths (`/usr/lib/...`) onto the filesystem being resolved.
///
/// The host layout is the identity. A rooted layout prefixes every
/// host-style path with its root, which lets a directory tree stand in for
/// the system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

impl Layout {
    pub fn host() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_string_lossy();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.root.is_empty()
    }

    pub fn lib_dir(&self) -> String {
        format!("{}/usr/lib", self.root)
    }

    pub fn bin_dir(&self) -> String {
        format!("{}/usr/bin", self.root)
    }

    fn under_root(&self, path: &str) -> bool {
        !self.is_host()
            && path
                .strip_prefix(&self.root)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Place a host-style absolute path under the root.
    pub fn rebase(&self, path: &str) -> String {
        if self.is_host() || !path.starts_with('/') || self.under_root(path) {
            path.to_string()
        } else {
            format!("{}{}", self.root, path)
        }
    }

    /// The path as the sandbox sees it.
    pub fn sandbox_path<'a>(&self, path: &'a str) -> &'a str {
        if self.under_root(path) {
            match &path[self.root.len()..] {
                "" => "/",
                rest => rest,
            }
        } else {
            path
        }
    }

    /// Path relative to the library root, if `path` lies beneath it.
    pub fn lib_subpath<'a>(&self, path: &'a str) -> Option<&'a str> {
        let lib_dir = self.lib_dir();
        path.strip_prefix(lib_dir.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    /// Canonical form of a library path reported by the loader.
    ///
    /// `lib64` collapses to `lib`, `/lib/` moves under `/usr/lib/`, other
    /// absolute paths are placed under `/usr/lib`, and anything still
    /// containing `..` falls back to `/usr/lib/<basename>`.
    pub fn normalize_library(&self, path: &str) -> String {
        let host = self.sandbox_path(path);
        let mut normalized = host.replace("lib64", "lib");
        if !normalized.starts_with("/usr/lib/") {
            if normalized.starts_with("/lib/") {
                normalized = format!("/usr{normalized}");
            } else if normalized.starts_with('/') {
                normalized = format!("/usr/lib{normalized}");
            }
        }
        if normalized.contains("..") {
            normalized = format!("/usr/lib/{}", crate::util::basename(&normalized));
        }
        self.rebase(&normalized)
    }

    /// A library entity as the resolver expects it: absolute paths move
    /// onto the layout, bare names go under the library root, and relative
    /// globs are left for the library root search.
    pub fn library_entity(&self, entity: &str) -> String {
        if entity.starts_with('/') {
            self.rebase(entity)
        } else if entity.contains('*') {
            entity.to_string()
        } else {
            format!("{}/{}", self.lib_dir(), entity)
        }
    }

    /// Canonical form of a binary path: `/bin/...` becomes `/usr/bin/...`.
    pub fn normalize_binary(&self, path: &str) -> String {
        let rooted = self.under_root(path);
        let host = self.sandbox_path(path);
        let normalized = match host.strip_prefix("/bin/") {
            Some(rest) => format!("/usr/bin/{rest}"),
            None => host.to_string(),
        };
        if rooted {
            format!("{}{}", self.root, normalized)
        } else {
            normalized
        }
    }
}

/// Shared state for one resolution run
pub struct ResolverContext {
    layout: Layout,
    tools: Tools,
    pool: WorkerPool,
    cache: ResolutionCache,
    /// Binaries already visited in this run
    searched: Mutex<HashSet<String>>,
    /// Library directories that are mounted as a whole
    directories: Mutex<BTreeSet<String>>,
}

impl ResolverContext {
    pub fn new(layout: Layout, tools: Tools, pool: WorkerPool, cache: ResolutionCache) -> Arc<Self> {
        Arc::new(Self {
            layout,
            tools,
            pool,
            cache,
            searched: Mutex::new(HashSet::new()),
            directories: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn add_directory(&self, dir: impl Into<String>) {
        lock(&self.directories).insert(dir.into());
    }

    pub fn directories(&self) -> BTreeSet<String> {
        lock(&self.directories).clone()
    }

    pub fn retain_directories(&self, keep: impl FnMut(&String) -> bool) {
        lock(&self.directories).retain(keep);
    }

    /// Record `path` as visited, returning false if it already was.
    fn mark_searched(&self, path: &str) -> bool {
        lock(&self.searched).insert(path.to_string())
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Up to `len` leading bytes of a file; empty if it cannot be read.
pub(crate) async fn read_header(path: &str, len: usize) -> Vec<u8> {
    let Ok(file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    let mut header = Vec::with_capacity(len);
    match file.take(len as u64).read_to_end(&mut header).await {
        Ok(_) => header,
        Err(_) => Vec::new(),
    }
}

pub(crate) async fn is_elf(path: &str) -> bool {
    read_header(path, ELF_MAGIC.len()).await == ELF_MAGIC
}
