//! Resolve command - print dependency closures

use crate::cli::args::{OutputFormat, ResolveArgs};
use crate::config::Config;
use crate::error::SbResult;
use crate::exec::Tools;
use crate::pool::WorkerPool;
use crate::resolve::{DependencySet, Layout, ResolutionCache, ResolverContext};
use console::style;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Resolution {
    target: String,
    binaries: Vec<String>,
    libraries: Vec<String>,
    directories: Vec<String>,
}

/// Execute the resolve command
pub async fn execute(args: ResolveArgs, config: &Config) -> SbResult<()> {
    let pool = WorkerPool::new(config.pool.workers);
    let tools = Tools::from_config(&config.tools);
    let layout = Layout::host();

    let mut resolutions = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let cache = if args.no_cache {
            ResolutionCache::disabled()
        } else {
            ResolutionCache::new(config.paths.data_dir().join("cache"), false)
        };
        // Each target gets its own visited set
        let ctx = ResolverContext::new(layout.clone(), tools.clone(), pool.clone(), cache);

        let mut libraries = DependencySet::new();
        let binaries = if args.library {
            libraries = ctx.resolve_library(&layout.library_entity(path)).await;
            DependencySet::new()
        } else {
            ctx.resolve_binary(path, &mut libraries).await?
        };
        pool.wait().await?;

        resolutions.push(Resolution {
            target: path.clone(),
            binaries: binaries.into_iter().collect(),
            libraries: libraries.into_iter().collect(),
            directories: ctx.directories().into_iter().collect(),
        });
    }

    match args.format {
        OutputFormat::Plain => print_plain(&resolutions),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resolutions)?),
    }
    Ok(())
}

fn print_plain(resolutions: &[Resolution]) {
    for resolution in resolutions {
        println!("{}", style(&resolution.target).bold());
        for (label, entries) in [
            ("binaries", &resolution.binaries),
            ("libraries", &resolution.libraries),
            ("directories", &resolution.directories),
        ] {
            if entries.is_empty() {
                continue;
            }
            println!("  {} ({})", style(label).cyan(), entries.len());
            for entry in entries {
                println!("    {entry}");
            }
        }
    }
}
