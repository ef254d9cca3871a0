//! Sandbox command assembly
//!
//! A launch either reuses the cached command of an earlier run with the
//! same fingerprint, or resolves the program's closure, starts populating
//! the object store in the background, and emits the bind arguments while
//! that runs. The store must be complete before the command is returned.

use super::bwrap::{self, BindMode, Emitter};
use super::features::{self, HostDirs, Profile};
use crate::config::Config;
use crate::error::SbResult;
use crate::exec::Tools;
use crate::options::{AppDir, Namespace, SandboxOptions, SysDir, UpdateLevel};
use crate::pool::WorkerPool;
use crate::resolve::{DependencySet, Layout, ResolutionCache, ResolverContext};
use crate::store::{AppCache, ExclusionSet, ObjectStore, PopulateMode, StoreRequest};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A generated command, without the per-launch runtime arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub args: Vec<String>,
    /// Where the program is found inside the sandbox
    pub program: String,
    pub fingerprint: String,
    /// Whether `args` came from the command cache
    pub reused: bool,
}

pub struct Assembler {
    ctx: Arc<ResolverContext>,
    store: ObjectStore,
    data_dir: PathBuf,
    host: HostDirs,
}

impl Assembler {
    pub fn new(
        ctx: Arc<ResolverContext>,
        store: ObjectStore,
        data_dir: impl Into<PathBuf>,
        host: HostDirs,
    ) -> Self {
        Self {
            ctx,
            store,
            data_dir: data_dir.into(),
            host,
        }
    }

    /// Assembler for the host system as configured.
    ///
    /// Resolution caches are refreshed when `update` asks for it.
    pub fn from_config(config: &Config, update: UpdateLevel) -> Self {
        let pool = WorkerPool::new(config.pool.workers);
        let data_dir = config.paths.data_dir();
        let cache = ResolutionCache::new(data_dir.join("cache"), update.refreshes_caches());
        let layout = Layout::host();
        let ctx = ResolverContext::new(
            layout.clone(),
            Tools::from_config(&config.tools),
            pool.clone(),
            cache,
        );
        let store = ObjectStore::new(config.paths.store_root(), layout, pool);
        Self::new(ctx, store, data_dir, HostDirs::detect())
    }

    pub fn context(&self) -> &Arc<ResolverContext> {
        &self.ctx
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn host(&self) -> &HostDirs {
        &self.host
    }

    pub async fn cmd(&self, options: &SandboxOptions) -> SbResult<Assembly> {
        let app = options.app_id()?;
        let fingerprint = options.fingerprint();
        let cache = AppCache::new(&self.data_dir, &app);
        let bypass_lib = options.sys_dirs.contains(&SysDir::Lib);

        let stored = cache.load_closure().await;
        let fresh = matches!(&stored, Some((fp, _)) if *fp == fingerprint);
        let update_store = !bypass_lib && (options.update.refreshes_store() || !fresh);

        if !bypass_lib && !update_store {
            if !self.store.is_populated(&app).await {
                if let Some((_, closure)) = &stored {
                    info!("Store for {} is missing, restoring it from the recorded closure", app);
                    let profiles = features::profiles(&options.features, &options.share);
                    let mounted = self.direct_mounts(options, &profiles, &app);
                    self.store
                        .setup(closure, &app, &mounted, PopulateMode::IfMissing)
                        .await?;
                }
            }
            match cache.load_command().await {
                Some((fp, args)) if fp == fingerprint => {
                    debug!("Reusing cached command for {}", app);
                    return Ok(Assembly {
                        args,
                        program: self.launch_path(options)?,
                        fingerprint,
                        reused: true,
                    });
                }
                _ => debug!("No usable command cache for {}", app),
            }
        }

        let mode = if options.update.wipes_store() {
            PopulateMode::Wipe
        } else if stored.is_none() {
            PopulateMode::IfMissing
        } else {
            PopulateMode::Refresh
        };
        let args = self
            .generate(options, &app, &fingerprint, &cache, update_store.then_some(mode))
            .await?;

        // Population must finish before the command may be used
        self.ctx.pool().wait().await?;
        cache.save_command(&fingerprint, &args).await?;

        Ok(Assembly {
            args,
            program: self.launch_path(options)?,
            fingerprint,
            reused: false,
        })
    }

    /// Resolve and emit; populates the store in the background when a
    /// populate mode is given.
    async fn generate(
        &self,
        options: &SandboxOptions,
        app: &str,
        fingerprint: &str,
        cache: &AppCache,
        populate: Option<PopulateMode>,
    ) -> SbResult<Vec<String>> {
        let ctx = &self.ctx;
        let layout = ctx.layout();
        let profiles = features::profiles(&options.features, &options.share);
        let (share, sys_dirs) = effective_sharing(options, &profiles);
        let bypass_lib = sys_dirs.contains(&SysDir::Lib);
        let bypass_bin = sys_dirs.contains(&SysDir::Bin);

        let exclusions =
            ExclusionSet::expand(options.excluded_libraries(), ctx.tools(), layout).await;

        let mut libraries = DependencySet::new();
        let mut binaries = DependencySet::new();
        if !(bypass_lib && bypass_bin) {
            binaries.extend(ctx.resolve_binary(&options.program, &mut libraries).await?);
            for binary in &options.binaries {
                binaries.extend(ctx.resolve_binary(binary, &mut libraries).await?);
            }
            for binary in profiles.iter().flat_map(|p| &p.binaries) {
                match ctx.resolve_binary(binary, &mut libraries).await {
                    Ok(found) => binaries.extend(found),
                    Err(e) => warn!("Skipping feature binary {}: {}", binary, e),
                }
            }
        }

        for dir in self.direct_mounts(options, &profiles, app) {
            ctx.add_directory(dir);
        }

        if let Some(mode) = populate {
            let entities: Vec<String> = options
                .included_libraries()
                .map(|spec| spec.path.as_str())
                .chain(profiles.iter().flat_map(|p| &p.libraries).map(String::as_str))
                .map(|entity| layout.library_entity(entity))
                .collect();
            for found in join_all(entities.iter().map(|e| ctx.resolve_library(e))).await {
                libraries.extend(found);
            }

            ctx.retain_directories(|d| exclusions.allows_directory(d));
            let directories = ctx.directories();
            for found in join_all(directories.iter().map(|d| ctx.resolve_library(d))).await {
                libraries.extend(found);
            }

            self.populate(libraries, app, fingerprint, exclusions, directories, cache, mode);
        } else {
            ctx.retain_directories(|d| exclusions.allows_directory(d));
        }

        let mut e = Emitter::new(layout, &self.host);
        if bypass_lib {
            e.overlay("/usr/lib", "/usr/lib");
        }
        if bypass_bin {
            e.overlay("/usr/bin", "/usr/bin");
        }
        e.setenv("HOME", "/home/sb");
        e.setenv("PATH", "/usr/bin");

        for profile in &profiles {
            for (key, value) in &profile.env {
                e.setenv(key, value);
            }
            e.share(&profile.dev_binds, BindMode::Device);
            e.share(&profile.ro_binds, BindMode::ReadOnly);
            for (target, link) in &profile.symlinks {
                e.symlink(target, link);
            }
        }

        e.namespaces(&share);
        e.sys_dirs(&sys_dirs, &options.devices);
        if options.app_dirs.contains(&AppDir::Share) {
            e.share([format!("/usr/share/{app}")], BindMode::ReadOnly);
        }
        if options.app_dirs.contains(&AppDir::Etc) {
            e.share([format!("/etc/{app}")], BindMode::ReadOnly);
        }

        if !bypass_bin {
            e.binaries(&binaries);
        }
        e.bin_symlinks();

        if !bypass_lib {
            let app_lib = self.store.app_lib_dir(app);
            e.overlay(&app_lib.to_string_lossy(), "/usr/lib");
        }
        e.lib_symlinks();
        e.share(&ctx.directories(), BindMode::ReadOnly);

        Ok(e.into_args())
    }

    /// Hand the closure to the store on the pool; joined by `pool.wait()`.
    #[allow(clippy::too_many_arguments)]
    fn populate(
        &self,
        raw: DependencySet,
        app: &str,
        fingerprint: &str,
        exclusions: ExclusionSet,
        mounted: BTreeSet<String>,
        cache: &AppCache,
        mode: PopulateMode,
    ) {
        let store = self.store.clone();
        let app = app.to_string();
        let fingerprint = fingerprint.to_string();
        let cache = cache.clone();
        self.ctx.pool().detach(async move {
            let request = StoreRequest {
                app: &app,
                fingerprint: &fingerprint,
                exclusions: &exclusions,
                mounted: &mounted,
                cache: &cache,
                mode,
            };
            let outcome = store.resolve(&raw, &request).await?;
            debug!("Store for {}: {:?}", app, outcome);
            Ok(())
        });
    }

    /// Existing directories bound whole instead of going through the store.
    fn direct_mounts(
        &self,
        options: &SandboxOptions,
        profiles: &[Profile],
        app: &str,
    ) -> BTreeSet<String> {
        let layout = self.ctx.layout();
        let mut directories: Vec<String> = profiles
            .iter()
            .flat_map(|p| &p.directories)
            .map(|d| layout.rebase(d))
            .collect();
        if options.app_dirs.contains(&AppDir::Lib) {
            directories.push(format!("{}/{app}", layout.lib_dir()));
        }
        if options.app_dirs.contains(&AppDir::Opt) {
            directories.push(layout.rebase(&format!("/opt/{app}")));
        }
        directories.extend(
            options
                .included_libraries()
                .map(|spec| spec.path.as_str())
                .chain(profiles.iter().flat_map(|p| &p.libraries).map(String::as_str))
                .filter(|entity| !entity.contains('*'))
                .map(|entity| layout.library_entity(entity)),
        );
        directories
            .into_iter()
            .filter(|dir| Path::new(dir).is_dir())
            .collect()
    }

    fn launch_path(&self, options: &SandboxOptions) -> SbResult<String> {
        let located = self.ctx.locate(&options.program)?;
        Ok(bwrap::bin_destination(self.ctx.layout().sandbox_path(&located)))
    }
}

/// Namespaces and system directories after feature requirements are added.
fn effective_sharing(
    options: &SandboxOptions,
    profiles: &[Profile],
) -> (BTreeSet<Namespace>, BTreeSet<SysDir>) {
    let mut share = options.share.clone();
    let mut sys_dirs = options.sys_dirs.clone();
    for profile in profiles {
        if profile.user_namespace {
            share.insert(Namespace::User);
        }
        if profile.proc {
            sys_dirs.insert(SysDir::Proc);
        }
    }
    (share, sys_dirs)
}
