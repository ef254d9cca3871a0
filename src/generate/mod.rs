//! bwrap command generation
//!
//! The cacheable part of a command comes from [`Assembler`]. Arguments that
//! depend on the launching session are added by [`runtime_args`] on every
//! launch and never stored.

pub mod bwrap;
pub mod cmd;
pub mod features;

pub use cmd::{Assembler, Assembly};
pub use features::HostDirs;

use crate::options::{QtVersion, SandboxOptions};

/// Session variables passed through when set.
const SESSION_ENV: &[&str] = &["XDG_RUNTIME_DIR", "XDG_CURRENT_DESKTOP", "DESKTOP_SESSION"];

/// Per-launch arguments, read from the current environment.
pub fn runtime_args(options: &SandboxOptions) -> Vec<String> {
    runtime_args_with(options, |key| std::env::var(key).ok())
}

fn runtime_args_with(
    options: &SandboxOptions,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    let mut args: Vec<String> = ["--new-session", "--die-with-parent", "--clearenv", "--unshare-uts"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !options.hostname {
        args.extend(["--hostname", "sandbox"].map(String::from));
    }
    args.extend(["--tmpfs", "/tmp", "--tmpfs", "/home/sb/.cache"].map(String::from));

    let f = &options.features;
    let gui = f.gui || f.gtk.is_some() || f.qt.is_some() || f.vulkan || f.electron.is_some();
    let mut passthrough: Vec<&str> = SESSION_ENV.to_vec();
    if f.qt == Some(QtVersion::Kf6) {
        passthrough.extend(["KDE_FULL_SESSION", "KDE_SESSION_VERSION"]);
    }
    if gui {
        passthrough.push("XDG_SESSION_DESKTOP");
    }
    if f.locale {
        passthrough.extend(["LANG", "LANGUAGE", "LC_ALL"]);
    }
    for key in passthrough {
        if let Some(value) = lookup(key) {
            args.extend(["--setenv".to_string(), key.to_string(), value]);
        }
    }

    if f.shell {
        args.extend(["--setenv", "SHELL", "/usr/bin/sh"].map(String::from));
    }
    for (key, value) in &options.env {
        args.extend(["--setenv".to_string(), key.clone(), value.clone()]);
    }
    args
}

/// The complete argument vector for the sandbox launcher, without the
/// launcher itself.
pub fn full_command(options: &SandboxOptions, assembly: &Assembly) -> Vec<String> {
    let mut args = runtime_args(options);
    args.extend(assembly.args.iter().cloned());
    args.push(assembly.program.clone());
    args.extend(options.args.iter().cloned());
    args
}
