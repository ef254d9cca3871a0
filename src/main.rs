//! sb - Minimal bubblewrap sandboxes
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use sb::cli::{Cli, Commands};
use sb::config::ConfigManager;
use sb::error::{SbError, SbResult};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        // The sandboxed program already reported its own failure
        Err(SbError::SandboxExit(code)) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> SbResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; RUST_LOG takes precedence
    let default_filter = match cli.verbose {
        0 => "sb=warn",
        1 => "sb=info",
        _ => "sb=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Run(args) => sb::cli::commands::run(*args, &config).await,
        Commands::Resolve(args) => sb::cli::commands::resolve(args, &config).await,
        Commands::Cache(args) => sb::cli::commands::cache(args, &config).await,
        Commands::Config(args) => sb::cli::commands::config(args, &config, &config_manager).await,
    }
}
