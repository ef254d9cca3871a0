//! Sandbox options and the fingerprint over the ones that shape the store

use crate::error::{SbError, SbResult};
use crate::util;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How much previously cached state to discard before a run
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UpdateLevel {
    /// Reuse everything that is still valid
    #[default]
    Off,
    /// Repopulate the object store and regenerate the command
    Libraries,
    /// Also discard the per-entity resolution caches
    Cache,
    /// Also wipe the application's store directory
    All,
}

impl UpdateLevel {
    pub fn refreshes_store(self) -> bool {
        self >= Self::Libraries
    }

    pub fn refreshes_caches(self) -> bool {
        self >= Self::Cache
    }

    pub fn wipes_store(self) -> bool {
        self == Self::All
    }
}

/// Namespaces that may be shared with the host
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    All,
    None,
    User,
    Ipc,
    Pid,
    Net,
    Cgroup,
}

impl Namespace {
    /// Namespaces bubblewrap can unshare one at a time.
    pub fn individual() -> &'static [Namespace] {
        &[Self::User, Self::Ipc, Self::Pid, Self::Net, Self::Cgroup]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::None => "none",
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Cgroup => "cgroup",
        }
    }
}

/// Host system directories exposed wholesale
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SysDir {
    Dev,
    Proc,
    Lib,
    Bin,
    Etc,
    Share,
    Var,
}

impl SysDir {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Proc => "proc",
            Self::Lib => "lib",
            Self::Bin => "bin",
            Self::Etc => "etc",
            Self::Share => "share",
            Self::Var => "var",
        }
    }
}

/// Per-application directories named after the program
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AppDir {
    Lib,
    Share,
    Etc,
    Opt,
}

impl AppDir {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lib => "lib",
            Self::Share => "share",
            Self::Etc => "etc",
            Self::Opt => "opt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize)]
pub enum GtkVersion {
    #[value(name = "3")]
    #[serde(rename = "3")]
    Gtk3,
    #[value(name = "4")]
    #[serde(rename = "4")]
    Gtk4,
    #[value(name = "all")]
    #[serde(rename = "all")]
    All,
}

impl GtkVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gtk3 => "3",
            Self::Gtk4 => "4",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize)]
pub enum QtVersion {
    #[value(name = "5")]
    #[serde(rename = "5")]
    Qt5,
    #[value(name = "6")]
    #[serde(rename = "6")]
    Qt6,
    #[value(name = "kf6")]
    #[serde(rename = "kf6")]
    Kf6,
}

impl QtVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qt5 => "5",
            Self::Qt6 => "6",
            Self::Kf6 => "kf6",
        }
    }
}

/// A library entity with an optional exclusion modifier (`path:x`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibrarySpec {
    pub path: String,
    pub exclude: bool,
}

impl LibrarySpec {
    pub fn include(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exclude: false,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.path.contains('*')
    }
}

impl FromStr for LibrarySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (path, exclude) = match s.rsplit_once(':') {
            Some((path, "x")) => (path, true),
            Some((_, modifier)) => {
                return Err(format!("unknown library modifier '{modifier}' in '{s}'"));
            }
            None => (s, false),
        };
        if path.is_empty() {
            return Err("library path cannot be empty".to_string());
        }
        Ok(Self {
            path: path.to_string(),
            exclude,
        })
    }
}

impl fmt::Display for LibrarySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exclude {
            write!(f, "{}:x", self.path)
        } else {
            write!(f, "{}", self.path)
        }
    }
}

/// Feature toggles that pull in predefined profiles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub gui: bool,
    pub gtk: Option<GtkVersion>,
    pub qt: Option<QtVersion>,
    pub vulkan: bool,
    pub pipewire: bool,
    /// `Some("")` selects the system electron, otherwise a versioned one
    pub electron: Option<String>,
    pub python: Option<String>,
    pub locale: bool,
    pub include: bool,
    pub shell: bool,
    pub xdg_open: bool,
    pub hardened_malloc: bool,
}

/// Everything one invocation needs to build and launch a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    /// Target program, a name on PATH or a path
    pub program: String,
    pub args: Vec<String>,
    pub update: UpdateLevel,
    pub libraries: Vec<LibrarySpec>,
    pub binaries: Vec<String>,
    pub share: BTreeSet<Namespace>,
    pub sys_dirs: BTreeSet<SysDir>,
    pub app_dirs: BTreeSet<AppDir>,
    pub devices: Vec<String>,
    pub features: Features,
    pub dry: bool,
    pub hostname: bool,
    pub env: Vec<(String, String)>,
}

impl SandboxOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            update: UpdateLevel::Off,
            libraries: Vec::new(),
            binaries: Vec::new(),
            share: BTreeSet::from([Namespace::None]),
            sys_dirs: BTreeSet::new(),
            app_dirs: BTreeSet::new(),
            devices: Vec::new(),
            features: Features::default(),
            dry: false,
            hostname: false,
            env: Vec::new(),
        }
    }

    /// Identifier used for the store and cache directories.
    pub fn app_id(&self) -> SbResult<String> {
        let name = util::basename(&self.program);
        if name.is_empty()
            || name.contains('/')
            || name == "."
            || name == ".."
            || name == "shared"
        {
            return Err(SbError::InvalidOption(format!(
                "cannot derive an application name from '{}'",
                self.program
            )));
        }
        Ok(name.to_string())
    }

    pub fn shares(&self, namespace: Namespace) -> bool {
        self.share.contains(&namespace)
    }

    pub fn included_libraries(&self) -> impl Iterator<Item = &LibrarySpec> {
        self.libraries.iter().filter(|l| !l.exclude)
    }

    pub fn excluded_libraries(&self) -> impl Iterator<Item = &LibrarySpec> {
        self.libraries.iter().filter(|l| l.exclude)
    }

    /// Options that change the resolved closure or the generated command,
    /// in a fixed order.
    pub fn store_settings(&self) -> Vec<(&'static str, String)> {
        let mut libraries: Vec<String> = self.libraries.iter().map(ToString::to_string).collect();
        libraries.sort();
        let mut binaries = self.binaries.clone();
        binaries.sort();
        let mut devices = self.devices.clone();
        devices.sort();

        let f = &self.features;
        vec![
            ("program", self.program.clone()),
            ("libraries", libraries.join(",")),
            ("binaries", binaries.join(",")),
            ("share", join(self.share.iter().map(|n| n.as_str()))),
            ("sys_dirs", join(self.sys_dirs.iter().map(|d| d.as_str()))),
            ("app_dirs", join(self.app_dirs.iter().map(|d| d.as_str()))),
            ("devices", devices.join(",")),
            ("gui", f.gui.to_string()),
            ("gtk", f.gtk.map(|v| v.as_str()).unwrap_or_default().to_string()),
            ("qt", f.qt.map(|v| v.as_str()).unwrap_or_default().to_string()),
            ("vulkan", f.vulkan.to_string()),
            ("pipewire", f.pipewire.to_string()),
            ("electron", f.electron.clone().map(|v| format!("={v}")).unwrap_or_default()),
            ("python", f.python.clone().unwrap_or_default()),
            ("locale", f.locale.to_string()),
            ("include", f.include.to_string()),
            ("shell", f.shell.to_string()),
            ("xdg_open", f.xdg_open.to_string()),
            ("hardened_malloc", f.hardened_malloc.to_string()),
        ]
    }

    /// Hash of the program version and every store-relevant option.
    ///
    /// Runtime-only options (dry, hostname, env, program arguments) and the
    /// update level are left out so they never invalidate the caches.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
        hasher.update(b"\n");
        for (key, value) in self.store_settings() {
            hasher.update(format!("{key}={value}\n").as_bytes());
        }
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(",")
}
