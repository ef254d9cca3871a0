//! Cache command - inspect and clear per-application state

use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::{SbError, SbResult};
use crate::pool::WorkerPool;
use crate::resolve::Layout;
use crate::store::{AppCache, ObjectStore, StoreLock, SHARED_DIR};
use chrono::{DateTime, Local, Utc};
use console::style;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// What is known about one application
#[derive(Debug, Serialize)]
struct AppEntry {
    name: String,
    fingerprint: Option<String>,
    libraries: usize,
    populated: bool,
    command_cached: bool,
    updated: Option<DateTime<Utc>>,
}

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> SbResult<()> {
    let data_dir = config.paths.data_dir();
    let store = ObjectStore::new(
        config.paths.store_root(),
        Layout::host(),
        WorkerPool::new(1),
    );

    match args.action {
        CacheAction::List { format } => {
            let entries = list_apps(&data_dir, &store).await?;
            match format {
                OutputFormat::Plain => print_table(&entries),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            }
        }
        CacheAction::Path { app } => show_paths(&data_dir, &store, app.as_deref()),
        CacheAction::Clear { app: Some(app), .. } => clear_app(&data_dir, &store, &app).await?,
        CacheAction::Clear { app: None, .. } => clear_all(&data_dir, &store).await?,
    }
    Ok(())
}

/// Applications with a cache directory or a store directory.
async fn list_apps(data_dir: &Path, store: &ObjectStore) -> SbResult<Vec<AppEntry>> {
    let mut names = dir_names(&AppCache::apps_dir(data_dir)).await?;
    names.extend(
        dir_names(store.root())
            .await?
            .into_iter()
            .filter(|name| name != SHARED_DIR),
    );

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let cache = AppCache::new(data_dir, &name);
        let closure = cache.load_closure().await;
        entries.push(AppEntry {
            fingerprint: closure.as_ref().map(|(fp, _)| fp.clone()),
            libraries: closure.map(|(_, set)| set.len()).unwrap_or(0),
            populated: store.is_populated(&name).await,
            command_cached: cache.command_path().exists(),
            updated: modified(&cache.closure_path()).await,
            name,
        });
    }
    Ok(entries)
}

async fn modified(path: &Path) -> Option<DateTime<Utc>> {
    let meta = fs::metadata(path).await.ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}

async fn dir_names(dir: &Path) -> SbResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(SbError::io(format!("listing {}", dir.display()), e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SbError::io(format!("listing {}", dir.display()), e))?
    {
        if entry.path().is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn print_table(entries: &[AppEntry]) {
    if entries.is_empty() {
        println!("No cached applications.");
        return;
    }

    println!(
        "{:<24} {:<34} {:>9} {:<8} {:<16}",
        style("APP").bold(),
        style("FINGERPRINT").bold(),
        style("LIBRARIES").bold(),
        style("STORE").bold(),
        style("UPDATED").bold()
    );
    for entry in entries {
        let state = if entry.populated {
            style("ready").green()
        } else {
            style("empty").dim()
        };
        let updated = entry
            .updated
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<34} {:>9} {:<8} {:<16}",
            entry.name,
            entry.fingerprint.as_deref().unwrap_or("-"),
            entry.libraries,
            state,
            updated
        );
    }
    println!();
    println!("{} application(s)", entries.len());
}

fn show_paths(data_dir: &Path, store: &ObjectStore, app: Option<&str>) {
    match app {
        Some(app) => {
            let cache = AppCache::new(data_dir, app);
            println!("closure: {}", cache.closure_path().display());
            println!("command: {}", cache.command_path().display());
            println!("store:   {}", store.app_lib_dir(app).display());
        }
        None => {
            println!("data:    {}", data_dir.display());
            println!("cache:   {}", data_dir.join("cache").display());
            println!("store:   {}", store.root().display());
        }
    }
}

async fn clear_app(data_dir: &Path, store: &ObjectStore, app: &str) -> SbResult<()> {
    if app.is_empty() || app == SHARED_DIR || app.contains('/') || app == "." || app == ".." {
        return Err(SbError::InvalidOption(format!("not an application name: '{app}'")));
    }

    let removed_store = if store.app_dir(app).is_dir() {
        // Wait for any launch still populating this application
        let _lock = StoreLock::acquire(&store.app_dir(app)).await?;
        store.remove_app(app).await?
    } else {
        false
    };
    let cache = AppCache::new(data_dir, app);
    let removed_cache = remove_dir(cache.dir()).await?;

    if removed_store || removed_cache {
        info!("Cleared {}", app);
        println!("{} Cleared cached state for {}", style("✓").green(), app);
    } else {
        println!("Nothing cached for {}", app);
    }
    Ok(())
}

async fn clear_all(data_dir: &Path, store: &ObjectStore) -> SbResult<()> {
    let targets: Vec<PathBuf> = vec![AppCache::apps_dir(data_dir), data_dir.join("cache")];
    for dir in &targets {
        if remove_dir(dir).await? {
            debug!("Removed {}", dir.display());
        }
    }

    // Only remove a root that actually looks like an object store
    if store.shared_dir().is_dir() {
        remove_dir(store.root()).await?;
    } else {
        debug!("No object store at {}", store.root().display());
    }

    println!("{} Cleared all caches and the object store", style("✓").green());
    Ok(())
}

async fn remove_dir(dir: &Path) -> SbResult<bool> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SbError::io(format!("removing {}", dir.display()), e)),
    }
}
