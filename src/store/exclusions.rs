//! Library exclusions (`path:x`) expanded once per invocation

use crate::exec::Tools;
use crate::options::LibrarySpec;
use crate::resolve::{DependencySet, Layout};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    files: DependencySet,
    directories: BTreeSet<String>,
}

impl ExclusionSet {
    /// Expand excluded entities into concrete files and directories.
    ///
    /// Globs match inside their own directory or the library root, bare
    /// names are taken relative to the library root.
    pub async fn expand<'a>(
        specs: impl IntoIterator<Item = &'a LibrarySpec>,
        tools: &Tools,
        layout: &Layout,
    ) -> Self {
        let lib_dir = layout.lib_dir();
        let mut set = Self::default();

        for spec in specs.into_iter().filter(|s| s.exclude) {
            if spec.is_wildcard() {
                let pattern = if spec.path.starts_with('/') {
                    layout.rebase(&spec.path)
                } else {
                    spec.path.clone()
                };
                match tools.matching(&pattern, &lib_dir, &["-mindepth", "1"]).await {
                    Ok(found) => set.files.extend(found),
                    Err(e) => warn!("Failed to expand exclusion {}: {}", spec.path, e),
                }
                continue;
            }

            let path = if spec.path.starts_with('/') {
                layout.rebase(&spec.path)
            } else {
                format!("{}/{}", lib_dir, spec.path)
            };
            if Path::new(&path).is_dir() {
                set.directories.insert(path);
            } else {
                set.files.insert(path);
            }
        }

        set
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains(path) || self.directories.iter().any(|d| within(path, d))
    }

    /// Whether a directory may still be mounted into the sandbox.
    pub fn allows_directory(&self, dir: &str) -> bool {
        !self.directories.contains(dir) && !self.directories.iter().any(|d| within(dir, d))
    }

    /// The closure with every excluded entry removed.
    pub fn trim(&self, closure: &DependencySet) -> DependencySet {
        closure
            .iter()
            .filter(|path| !self.contains(path))
            .cloned()
            .collect()
    }
}

/// Whether `path` lies strictly inside `dir`.
pub(crate) fn within(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir.trim_end_matches('/'))
        .is_some_and(|rest| rest.starts_with('/'))
}
