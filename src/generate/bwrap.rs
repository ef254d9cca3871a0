//! bwrap argument emission

use super::features::HostDirs;
use crate::options::{Namespace, SysDir};
use crate::resolve::{DependencySet, Layout};
use crate::util;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    ReadWrite,
    Device,
}

impl BindMode {
    fn flag(self) -> &'static str {
        match self {
            BindMode::ReadOnly => "--ro-bind",
            BindMode::ReadWrite => "--bind",
            BindMode::Device => "--dev-bind",
        }
    }
}

/// Accumulates bwrap arguments
pub struct Emitter<'a> {
    args: Vec<String>,
    layout: &'a Layout,
    host: &'a HostDirs,
}

impl<'a> Emitter<'a> {
    pub fn new(layout: &'a Layout, host: &'a HostDirs) -> Self {
        Self {
            args: Vec::new(),
            layout,
            host,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn args(&mut self, args: &[&str]) {
        self.args.extend(args.iter().map(|a| a.to_string()));
    }

    pub fn setenv(&mut self, key: &str, value: &str) {
        self.args(&["--setenv", key, value]);
    }

    pub fn symlink(&mut self, target: &str, link: &str) {
        self.args(&["--symlink", target, link]);
    }

    /// Overlay a writable temporary layer on top of `src` at `dest`.
    pub fn overlay(&mut self, src: &str, dest: &str) {
        self.args(&["--overlay-src", src, "--tmp-overlay", dest]);
    }

    /// Bind each existing path at its sandbox location.
    ///
    /// Paths are expanded against the host directories first; anything
    /// under the home directory appears under `/home/sb`.
    pub fn share<I, S>(&mut self, paths: I, mode: BindMode)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            let host_path = self.host.expand(path.as_ref());
            let source = self.layout.rebase(&host_path);
            if !Path::new(&source).exists() {
                continue;
            }
            let dest = self.host.sandbox_path(self.layout.sandbox_path(&source));
            let flag = mode.flag();
            self.args.extend([flag.to_string(), source.clone(), dest]);
        }
    }

    /// `--unshare-*` for every namespace not shared with the host.
    pub fn namespaces(&mut self, share: &BTreeSet<Namespace>) {
        if share.contains(&Namespace::None) {
            self.arg("--unshare-all");
        } else if !share.contains(&Namespace::All) {
            for ns in Namespace::individual() {
                if !share.contains(ns) {
                    self.arg(format!("--unshare-{}", ns.as_str()));
                }
            }
        }
        if !share.contains(&Namespace::User) && !share.contains(&Namespace::All) {
            self.args(&["--disable-userns", "--assert-userns-disabled"]);
        }
    }

    /// Host directories exposed wholesale.
    ///
    /// `lib` and `bin` are handled by the caller since they replace the
    /// resolved closure.
    pub fn sys_dirs(&mut self, sys_dirs: &BTreeSet<SysDir>, devices: &[String]) {
        if sys_dirs.contains(&SysDir::Dev) {
            self.args(&["--dev", "/dev"]);
        } else {
            self.share(devices, BindMode::Device);
        }
        if sys_dirs.contains(&SysDir::Proc) {
            self.args(&["--proc", "/proc"]);
        }
        for (dir, path) in [
            (SysDir::Etc, "/etc"),
            (SysDir::Share, "/usr/share"),
            (SysDir::Var, "/var"),
        ] {
            if sys_dirs.contains(&dir) {
                self.overlay(path, path);
            }
        }
    }

    /// Bind every resolved binary into `/usr/bin`.
    ///
    /// A symlinked binary binds its target and recreates the link so the
    /// program still sees the name it was started under.
    pub fn binaries(&mut self, binaries: &DependencySet) {
        self.args(&["--dir", "/usr/bin"]);
        for binary in binaries {
            let sandbox = self.layout.sandbox_path(binary).to_string();
            match std::fs::read_link(binary) {
                Ok(target) => {
                    let target = link_destination(&sandbox, &target.to_string_lossy());
                    let source = self.layout.rebase(&target);
                    let link = match sandbox.strip_prefix("/bin/") {
                        Some(rest) => format!("/usr/bin/{rest}"),
                        None => sandbox,
                    };
                    self.args(&["--ro-bind", source.as_str(), target.as_str()]);
                    self.symlink(&target, &link);
                }
                Err(_) => {
                    let dest = bin_destination(&sandbox);
                    self.args(&["--ro-bind", binary.as_str(), dest.as_str()]);
                }
            }
        }
    }

    pub fn bin_symlinks(&mut self) {
        for link in ["/bin", "/sbin", "/usr/sbin"] {
            self.symlink("/usr/bin", link);
        }
    }

    pub fn lib_symlinks(&mut self) {
        for link in ["/lib64", "/lib", "/usr/lib64"] {
            self.symlink("/usr/lib", link);
        }
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// Where a regular binary is bound: anything from a `bin` directory lands
/// in `/usr/bin`, everything else keeps its path.
pub fn bin_destination(sandbox: &str) -> String {
    if sandbox.contains("bin") {
        format!("/usr/bin/{}", util::basename(sandbox))
    } else {
        sandbox.to_string()
    }
}

/// Sandbox path a binary symlink points to.
///
/// Bare names live in `/usr/bin`, `/bin` targets move under `/usr`, and
/// relative paths are taken from the link's directory.
fn link_destination(link: &str, target: &str) -> String {
    if !target.contains('/') {
        return format!("/usr/bin/{target}");
    }
    let absolute = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{}/{}", util::dirname(link), target)
    };
    let normalized = util::normalize_lexical(&absolute);
    match normalized.strip_prefix("/bin/") {
        Some(rest) => format!("/usr/bin/{rest}"),
        None => normalized,
    }
}
