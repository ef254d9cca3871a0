//! CLI argument definitions using clap derive

use crate::options::{AppDir, GtkVersion, LibrarySpec, Namespace, QtVersion, SysDir, UpdateLevel};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// sb - Minimal bubblewrap sandboxes
///
/// Resolves exactly the binaries and shared libraries a program needs and
/// runs it in a bubblewrap sandbox that contains nothing else.
#[derive(Parser, Debug)]
#[command(name = "sb")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SB_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program in a sandbox
    Run(Box<RunArgs>),

    /// Print the binaries and libraries a program needs
    Resolve(ResolveArgs),

    /// Inspect or clear per-application caches and stores
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Program to run, a name on PATH or a path
    pub program: String,

    /// Refresh cached state before launching
    #[arg(short, long)]
    pub update: Option<UpdateLevel>,

    /// Extra libraries, directories or globs; append :x to exclude
    #[arg(short, long, value_delimiter = ',')]
    pub libraries: Vec<LibrarySpec>,

    /// Extra binaries to make available
    #[arg(short, long, value_delimiter = ',')]
    pub binaries: Vec<String>,

    /// Namespaces to share with the host (default: none)
    #[arg(short, long, value_delimiter = ',')]
    pub share: Vec<Namespace>,

    /// Host system directories to expose wholesale
    #[arg(long, value_delimiter = ',')]
    pub sys_dirs: Vec<SysDir>,

    /// Program-specific directories to expose
    #[arg(long, value_delimiter = ',')]
    pub app_dirs: Vec<AppDir>,

    /// Device nodes to bind when /dev is not exposed
    #[arg(long, value_delimiter = ',')]
    pub devices: Vec<String>,

    /// Enable Wayland and GPU access
    #[arg(long)]
    pub gui: bool,

    /// GTK toolkit support
    #[arg(long)]
    pub gtk: Option<GtkVersion>,

    /// Qt toolkit support
    #[arg(long)]
    pub qt: Option<QtVersion>,

    /// Vulkan support
    #[arg(long)]
    pub vulkan: bool,

    /// PipeWire and PulseAudio sockets
    #[arg(long)]
    pub pipewire: bool,

    /// Electron support; --electron=VERSION selects a versioned runtime
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "")]
    pub electron: Option<String>,

    /// Python version whose runtime should be available (e.g. 3.12)
    #[arg(long)]
    pub python: Option<String>,

    /// Locale and timezone data
    #[arg(long)]
    pub locale: bool,

    /// C and C++ headers and compiler support directories
    #[arg(long)]
    pub include: bool,

    /// Provide /usr/bin/sh
    #[arg(long)]
    pub shell: bool,

    /// Provide xdg-open through sb-open
    #[arg(long)]
    pub xdg_open: bool,

    /// Preload hardened_malloc
    #[arg(long)]
    pub hardened_malloc: bool,

    /// Print the command instead of running it
    #[arg(long)]
    pub dry: bool,

    /// Keep the host's hostname
    #[arg(long)]
    pub hostname: bool,

    /// Additional environment variables (KEY=VALUE)
    #[arg(short, long, value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,

    /// Arguments passed to the program
    #[arg(last = true)]
    pub args: Vec<String>,
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Programs (or library entities with --library) to resolve
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Treat paths as libraries, directories or globs
    #[arg(long)]
    pub library: bool,

    /// Output format
    #[arg(short, long, default_value = "plain")]
    pub format: OutputFormat,

    /// Neither read nor write resolution caches
    #[arg(long)]
    pub no_cache: bool,
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// One entry per line
    Plain,
    /// JSON output
    Json,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List applications with cached state
    List {
        /// Output format
        #[arg(short, long, default_value = "plain")]
        format: OutputFormat,
    },

    /// Show where caches and stores live
    Path {
        /// Application to show paths for
        app: Option<String>,
    },

    /// Remove cached state
    #[command(group(clap::ArgGroup::new("target").required(true).args(["app", "all"])))]
    Clear {
        /// Application whose caches and store are removed
        app: Option<String>,

        /// Remove every cache and the whole object store
        #[arg(long)]
        all: bool,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Parse environment variable in KEY=VALUE format
fn parse_env_var(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE format: empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
