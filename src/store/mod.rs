//! Shared object store
//!
//! Every library lands once in `<root>/shared` and is hard-linked into each
//! application's `<root>/<app>/lib`, which the sandbox overlays onto
//! `/usr/lib`. Symlinks are recreated in the application directory with
//! their original link text so versioned sonames keep resolving.

pub mod app_cache;
pub mod exclusions;
pub mod lock;

pub use app_cache::AppCache;
pub use exclusions::ExclusionSet;
pub use lock::StoreLock;

use crate::error::{SbError, SbResult};
use crate::pool::{self, WorkerPool};
use crate::resolve::{DependencySet, Layout};
use crate::util;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub const SHARED_DIR: &str = "shared";

/// How to treat an application directory that already has content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateMode {
    /// Leave a populated directory alone
    IfMissing,
    /// Add anything missing on top of what is there
    Refresh,
    /// Delete the directory and rebuild it
    Wipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    Populated { placed: usize, failed: usize },
    Skipped,
}

/// Everything [`ObjectStore::resolve`] needs besides the raw closure
pub struct StoreRequest<'a> {
    pub app: &'a str,
    pub fingerprint: &'a str,
    pub exclusions: &'a ExclusionSet,
    /// Directories mounted whole, whose contents stay out of the store
    pub mounted: &'a BTreeSet<String>,
    pub cache: &'a AppCache,
    pub mode: PopulateMode,
}

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
    layout: Layout,
    pool: WorkerPool,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>, layout: Layout, pool: WorkerPool) -> Self {
        Self {
            root: root.into(),
            layout,
            pool,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join(SHARED_DIR)
    }

    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(app)
    }

    /// Directory overlaid onto `/usr/lib` for `app`.
    pub fn app_lib_dir(&self, app: &str) -> PathBuf {
        self.app_dir(app).join("lib")
    }

    pub async fn is_populated(&self, app: &str) -> bool {
        util::dir_has_entries(&self.app_lib_dir(app)).await
    }

    /// Trim `raw` by the request's exclusions, populate the store from it,
    /// and record the trimmed closure under the request's fingerprint.
    pub async fn resolve(
        &self,
        raw: &DependencySet,
        request: &StoreRequest<'_>,
    ) -> SbResult<PopulateOutcome> {
        let trimmed = request.exclusions.trim(raw);
        debug!(
            "Store closure for {}: {} libraries ({} excluded)",
            request.app,
            trimmed.len(),
            raw.len() - trimmed.len()
        );

        let outcome = self
            .setup(&trimmed, request.app, request.mounted, request.mode)
            .await?;
        request
            .cache
            .save_closure(request.fingerprint, &trimmed)
            .await?;
        Ok(outcome)
    }

    /// Place every library of `closure` into the application directory.
    ///
    /// Entries inside a `mounted` directory are provided by that mount and
    /// skipped. Population runs under the application's lock; a concurrent
    /// run that finds the directory populated once it holds the lock skips.
    pub async fn setup(
        &self,
        closure: &DependencySet,
        app: &str,
        mounted: &BTreeSet<String>,
        mode: PopulateMode,
    ) -> SbResult<PopulateOutcome> {
        let app_lib = self.app_lib_dir(app);
        if mode == PopulateMode::IfMissing && self.is_populated(app).await {
            return Ok(PopulateOutcome::Skipped);
        }

        let _lock = StoreLock::acquire(&self.app_dir(app)).await?;
        if mode == PopulateMode::IfMissing && self.is_populated(app).await {
            debug!("{} was populated while waiting for the lock", app);
            return Ok(PopulateOutcome::Skipped);
        }

        if mode == PopulateMode::Wipe {
            match fs::remove_dir_all(&app_lib).await {
                Ok(()) => info!("Wiped {}", app_lib.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(SbError::io(format!("wiping {}", app_lib.display()), e)),
            }
        }

        let shared = self.shared_dir();
        for dir in [&shared, &app_lib] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| SbError::io(format!("creating {}", dir.display()), e))?;
        }

        let handles: Vec<_> = closure
            .iter()
            .filter(|lib| !mounted.iter().any(|d| exclusions::within(lib, d)))
            .map(|lib| {
                let placement = Placement {
                    library: lib.clone(),
                    shared: shared.clone(),
                    app_lib: app_lib.clone(),
                    layout: self.layout.clone(),
                };
                let pool = self.pool.clone();
                self.pool.submit(async move { pool.run(placement.place()).await })
            })
            .collect();

        let (mut placed, mut failed) = (0, 0);
        for handle in handles {
            match pool::join(handle).await.and_then(|r| r) {
                Ok(true) => placed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to place library for {}: {}", app, e);
                    failed += 1;
                }
            }
        }

        info!("Populated store for {}: {} new entries", app, placed);
        Ok(PopulateOutcome::Populated { placed, failed })
    }

    /// Delete an application's store directory.
    pub async fn remove_app(&self, app: &str) -> SbResult<bool> {
        let dir = self.app_dir(app);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SbError::io(format!("removing {}", dir.display()), e)),
        }
    }
}

/// One library's journey into the store
struct Placement {
    library: String,
    shared: PathBuf,
    app_lib: PathBuf,
    layout: Layout,
}

impl Placement {
    /// Returns whether anything new was placed.
    async fn place(self) -> SbResult<bool> {
        let Some(sub) = self.layout.lib_subpath(&self.library).map(str::to_string) else {
            debug!("Not under the library root: {}", self.library);
            return Ok(false);
        };

        let meta = match fs::symlink_metadata(&self.library).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SbError::io(format!("inspecting {}", self.library), e)),
        };
        if meta.is_dir() {
            return Ok(false);
        }

        let local = self.app_lib.join(&sub);
        if fs::symlink_metadata(&local).await.is_ok() {
            return Ok(false);
        }

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&self.library)
                .await
                .map_err(|e| SbError::io(format!("reading link {}", self.library), e))?;
            let target = target.to_string_lossy().into_owned();

            if let Some((resolved, link_text)) = self.link_target(&sub, &target) {
                let source = format!("{}/{}", self.layout.lib_dir(), resolved);
                let stored = self.shared.join(&resolved);
                copy_into(Path::new(&source), &stored).await?;
                link_into(&stored, &self.app_lib.join(&resolved)).await?;
                symlink_into(&link_text, &local).await?;
                return Ok(true);
            }
            // Points outside the library root: keep the content under the link's name
        }

        let stored = self.shared.join(&sub);
        copy_into(Path::new(&self.library), &stored).await?;
        link_into(&stored, &local).await?;
        Ok(true)
    }

    /// Where a symlink at `sub` points inside the library root, and the
    /// link text to recreate.
    fn link_target(&self, sub: &str, target: &str) -> Option<(String, String)> {
        if target.starts_with('/') {
            let absolute = self.layout.rebase(target);
            let resolved = self.layout.lib_subpath(&absolute)?.to_string();
            Some((resolved, self.layout.sandbox_path(&absolute).to_string()))
        } else {
            let base = sub.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            Some((join_relative(base, target)?, target.to_string()))
        }
    }
}

/// Join a relative link target onto `base`, refusing to climb above it.
fn join_relative(base: &str, target: &str) -> Option<String> {
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Copy `source` to `dest` unless it exists; the first writer wins.
async fn copy_into(source: &Path, dest: &Path) -> SbResult<()> {
    if fs::symlink_metadata(dest).await.is_ok() {
        return Ok(());
    }
    let parent = ensure_parent(dest).await?;

    let staging = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let copied = fs::copy(source, &staging).await;
    let result = match copied {
        Ok(_) => match fs::hard_link(&staging, dest).await {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        },
        Err(e) => Err(e),
    };
    let _ = fs::remove_file(&staging).await;
    result.map_err(|e| SbError::io(format!("copying {} into the store", source.display()), e))
}

async fn link_into(stored: &Path, local: &Path) -> SbResult<()> {
    ensure_parent(local).await?;
    match fs::hard_link(stored, local).await {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => {
            Err(SbError::io(format!("linking {}", local.display()), e))
        }
        _ => Ok(()),
    }
}

async fn symlink_into(link_text: &str, local: &Path) -> SbResult<()> {
    ensure_parent(local).await?;
    match fs::symlink(link_text, local).await {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => {
            Err(SbError::io(format!("creating symlink {}", local.display()), e))
        }
        _ => Ok(()),
    }
}

async fn ensure_parent(path: &Path) -> SbResult<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| SbError::Internal(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| SbError::io(format!("creating {}", parent.display()), e))?;
    Ok(parent.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LibrarySpec;
    use crate::testing::Sysroot;
    use std::os::unix::fs::MetadataExt;

    fn store(root: &Sysroot) -> ObjectStore {
        ObjectStore::new(root.path("store"), root.layout.clone(), WorkerPool::new(4))
    }

    fn inode(path: impl AsRef<Path>) -> u64 {
        std::fs::metadata(path).unwrap().ino()
    }

    #[test]
    fn relative_targets() {
        assert_eq!(join_relative("", "libx.so.1"), Some("libx.so.1".to_string()));
        assert_eq!(join_relative("qt6", "../libx.so"), Some("libx.so".to_string()));
        assert_eq!(join_relative("", "../../etc/passwd"), None);
    }

    #[tokio::test]
    async fn shared_copy_is_hard_linked_into_apps() {
        let root = Sysroot::new();
        let lib = root.elf("usr/lib/libfoo.so.1");
        let store = store(&root);
        let closure = DependencySet::from([lib.as_str()]);

        for app in ["one", "two"] {
            let outcome = store
                .setup(&closure, app, &BTreeSet::new(), PopulateMode::IfMissing)
                .await
                .unwrap();
            assert_eq!(outcome, PopulateOutcome::Populated { placed: 1, failed: 0 });
        }

        let shared = store.shared_dir().join("libfoo.so.1");
        let ino = inode(&shared);
        assert_eq!(inode(store.app_lib_dir("one").join("libfoo.so.1")), ino);
        assert_eq!(inode(store.app_lib_dir("two").join("libfoo.so.1")), ino);
        assert_eq!(std::fs::read_dir(store.shared_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn symlinks_keep_their_link_text() {
        let root = Sysroot::new();
        root.elf("usr/lib/libx.so.1");
        let link = root.symlink("libx.so.1", "usr/lib/libx.so");
        let store = store(&root);

        store
            .setup(
                &DependencySet::from([link.as_str()]),
                "app",
                &BTreeSet::new(),
                PopulateMode::IfMissing,
            )
            .await
            .unwrap();

        let app_lib = store.app_lib_dir("app");
        let recreated = app_lib.join("libx.so");
        assert!(std::fs::symlink_metadata(&recreated).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&recreated).unwrap(), Path::new("libx.so.1"));
        assert_eq!(
            inode(app_lib.join("libx.so.1")),
            inode(store.shared_dir().join("libx.so.1"))
        );
        // Following the recreated link reaches the stored content
        assert_eq!(
            std::fs::read(&recreated).unwrap(),
            std::fs::read(root.path("usr/lib/libx.so.1")).unwrap()
        );
    }

    #[tokio::test]
    async fn absolute_links_point_into_the_sandbox_view() {
        let root = Sysroot::new();
        root.elf("usr/lib/real/libz.so.1");
        let link = root.symlink(&root.path("usr/lib/real/libz.so.1"), "usr/lib/libz.so.1");
        let store = store(&root);

        store
            .setup(
                &DependencySet::from([link.as_str()]),
                "app",
                &BTreeSet::new(),
                PopulateMode::IfMissing,
            )
            .await
            .unwrap();

        let recreated = store.app_lib_dir("app").join("libz.so.1");
        assert_eq!(
            std::fs::read_link(&recreated).unwrap(),
            Path::new("/usr/lib/real/libz.so.1")
        );
        assert!(store.app_lib_dir("app").join("real/libz.so.1").exists());
    }

    #[tokio::test]
    async fn concurrent_launches_populate_once() {
        let root = Sysroot::new();
        let libs: Vec<String> = (0..20)
            .map(|i| root.elf(&format!("usr/lib/lib{i}.so")))
            .collect();
        let closure: DependencySet = libs.into_iter().collect();
        let store = store(&root);

        let a = {
            let (store, closure) = (store.clone(), closure.clone());
            tokio::spawn(async move {
                store
                    .setup(&closure, "app", &BTreeSet::new(), PopulateMode::IfMissing)
                    .await
            })
        };
        let b = {
            let (store, closure) = (store.clone(), closure.clone());
            tokio::spawn(async move {
                store
                    .setup(&closure, "app", &BTreeSet::new(), PopulateMode::IfMissing)
                    .await
            })
        };

        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let populated = outcomes
            .iter()
            .filter(|o| matches!(o, PopulateOutcome::Populated { .. }))
            .count();
        assert_eq!(populated, 1);
        assert!(outcomes.contains(&PopulateOutcome::Skipped));
        assert_eq!(std::fs::read_dir(store.app_lib_dir("app")).unwrap().count(), 20);
        assert!(!store.app_dir("app").join(lock::LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn wipe_discards_stale_entries() {
        let root = Sysroot::new();
        let old = root.elf("usr/lib/libold.so");
        let new = root.elf("usr/lib/libnew.so");
        let store = store(&root);
        let none = BTreeSet::new();

        store
            .setup(&DependencySet::from([old.as_str()]), "app", &none, PopulateMode::IfMissing)
            .await
            .unwrap();
        store
            .setup(&DependencySet::from([new.as_str()]), "app", &none, PopulateMode::Refresh)
            .await
            .unwrap();
        assert!(store.app_lib_dir("app").join("libold.so").exists());

        store
            .setup(&DependencySet::from([new.as_str()]), "app", &none, PopulateMode::Wipe)
            .await
            .unwrap();
        assert!(!store.app_lib_dir("app").join("libold.so").exists());
        assert!(store.app_lib_dir("app").join("libnew.so").exists());
    }

    #[tokio::test]
    async fn mounted_and_foreign_entries_are_skipped() {
        let root = Sysroot::new();
        let plugin = root.elf("usr/lib/plugins/libp.so");
        let lib = root.elf("usr/lib/libkept.so");
        let foreign = root.elf("opt/libforeign.so");
        let store = store(&root);
        let mounted = BTreeSet::from([root.path("usr/lib/plugins")]);

        let outcome = store
            .setup(
                &DependencySet::from([plugin.as_str(), lib.as_str(), foreign.as_str()]),
                "app",
                &mounted,
                PopulateMode::IfMissing,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PopulateOutcome::Populated { placed: 1, failed: 0 });
        assert!(!store.app_lib_dir("app").join("plugins").exists());
    }

    #[tokio::test]
    async fn resolve_excludes_and_records_closure() {
        let root = Sysroot::new();
        let foo = root.elf("usr/lib/libfoo.so.1");
        let bar = root.elf("usr/lib/libbar.so");
        let store = store(&root);
        let cache = AppCache::new(Path::new(&root.path("data")), "app");

        let specs: Vec<LibrarySpec> = vec!["libfoo*:x".parse().unwrap()];
        let exclusions = ExclusionSet::expand(&specs, &root.tools(), &root.layout).await;
        let mounted = BTreeSet::new();
        let request = StoreRequest {
            app: "app",
            fingerprint: "fp1",
            exclusions: &exclusions,
            mounted: &mounted,
            cache: &cache,
            mode: PopulateMode::IfMissing,
        };
        store
            .resolve(&DependencySet::from([foo.as_str(), bar.as_str()]), &request)
            .await
            .unwrap();

        assert!(!store.app_lib_dir("app").join("libfoo.so.1").exists());
        assert!(store.app_lib_dir("app").join("libbar.so").exists());
        let (fingerprint, closure) = cache.load_closure().await.unwrap();
        assert_eq!(fingerprint, "fp1");
        assert_eq!(closure, DependencySet::from([bar.as_str()]));
    }

    #[tokio::test]
    async fn exclusions_cover_non_executable_libraries() {
        let root = Sysroot::new();
        let foo = root.file("usr/lib/libfoo.so.1", "", 0o644);
        let bar = root.elf("usr/lib/libbar.so");
        let store = store(&root);
        let cache = AppCache::new(Path::new(&root.path("data")), "app");

        let specs: Vec<LibrarySpec> = vec!["libfoo*:x".parse().unwrap()];
        let exclusions = ExclusionSet::expand(&specs, &root.tools(), &root.layout).await;
        let mounted = BTreeSet::new();
        let request = StoreRequest {
            app: "app",
            fingerprint: "fp1",
            exclusions: &exclusions,
            mounted: &mounted,
            cache: &cache,
            mode: PopulateMode::IfMissing,
        };
        store
            .resolve(&DependencySet::from([foo.as_str(), bar.as_str()]), &request)
            .await
            .unwrap();

        let (_, closure) = cache.load_closure().await.unwrap();
        assert_eq!(closure, DependencySet::from([bar.as_str()]));
        assert!(!store.app_lib_dir("app").join("libfoo.so.1").exists());
        assert!(!store.shared_dir().join("libfoo.so.1").exists());
    }

    #[tokio::test]
    async fn different_apps_do_not_wait_on_each_other() {
        let root = Sysroot::new();
        let lib = root.elf("usr/lib/libfoo.so.1");
        let store = store(&root);

        let _held = StoreLock::acquire(&store.app_dir("one")).await.unwrap();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            store.setup(
                &DependencySet::from([lib.as_str()]),
                "two",
                &BTreeSet::new(),
                PopulateMode::IfMissing,
            ),
        )
        .await
        .expect("setup for another app blocked on a held lock")
        .unwrap();

        assert_eq!(outcome, PopulateOutcome::Populated { placed: 1, failed: 0 });
        assert!(store.app_lib_dir("two").join("libfoo.so.1").exists());
    }
}
