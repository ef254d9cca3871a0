//! Feature profiles
//!
//! Each enabled feature contributes binaries, library entities, mounted
//! library directories, host paths to bind, and environment variables.
//! Host paths may start with `$HOME`, `$CONFIG`, `$DATA` or `$RUNTIME`.

use crate::options::{Features, GtkVersion, Namespace, QtVersion};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: &'static str,
    pub binaries: Vec<String>,
    pub libraries: Vec<String>,
    pub directories: Vec<String>,
    pub ro_binds: Vec<String>,
    pub dev_binds: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `(target, link)` pairs created inside the sandbox
    pub symlinks: Vec<(String, String)>,
    /// Needs a procfs mounted
    pub proc: bool,
    /// Needs the user namespace shared
    pub user_namespace: bool,
}

fn owned<'a>(items: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
    items.iter().map(|s| s.to_string())
}

impl Profile {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn binaries(mut self, items: &[&str]) -> Self {
        self.binaries.extend(owned(items));
        self
    }

    fn libraries(mut self, items: &[&str]) -> Self {
        self.libraries.extend(owned(items));
        self
    }

    fn directories(mut self, items: &[&str]) -> Self {
        self.directories.extend(owned(items));
        self
    }

    fn ro_binds(mut self, items: &[&str]) -> Self {
        self.ro_binds.extend(owned(items));
        self
    }

    fn dev_binds(mut self, items: &[&str]) -> Self {
        self.dev_binds.extend(owned(items));
        self
    }

    fn env(mut self, pairs: &[(&str, &str)]) -> Self {
        self.env
            .extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }
}

/// Profiles for the enabled features, with implied features included.
///
/// Electron implies GTK 3; GTK, Qt and Vulkan imply the GUI profile.
pub fn profiles(features: &Features, share: &BTreeSet<Namespace>) -> Vec<Profile> {
    let mut out = Vec::new();

    if let Some(version) = &features.electron {
        let mut electron = Profile::new("electron")
            .dev_binds(&["/dev/null", "/dev/urandom", "/dev/shm"])
            .libraries(&["libsoftokn3*", "libfreeblpriv3*"]);
        if !version.is_empty() {
            electron.binaries.push(format!("/usr/bin/electron{version}"));
            electron.directories.push(format!("/usr/lib/electron{version}"));
        }
        electron.proc = true;
        electron.user_namespace = true;
        out.push(electron);
    }

    let gtk = features
        .gtk
        .or(features.electron.as_ref().map(|_| GtkVersion::Gtk3));
    if let Some(version) = gtk {
        out.push(gtk_profile(version));
    }

    if let Some(version) = features.qt {
        out.push(qt_profile(version));
    }

    if features.vulkan {
        out.push(
            Profile::new("vulkan")
                .ro_binds(&["/etc/vulkan", "/usr/share/vulkan"])
                .libraries(&["libvulkan*", "libVkLayer*"]),
        );
    }

    if features.gui || gtk.is_some() || features.qt.is_some() || features.vulkan {
        out.push(gui_profile());
    }

    if features.pipewire {
        out.push(
            Profile::new("pipewire")
                .ro_binds(&[
                    "$RUNTIME/pipewire-0",
                    "$RUNTIME/pulse",
                    "$CONFIG/pulse",
                    "/etc/pipewire",
                    "/usr/share/pipewire",
                ])
                .libraries(&["libpipewire*"])
                .directories(&["/usr/lib/pipewire-0.3", "/usr/lib/spa-0.2", "/usr/lib/pulseaudio"]),
        );
    }

    if features.locale {
        out.push(
            Profile::new("locale")
                .ro_binds(&[
                    "/etc/locale.conf",
                    "/etc/localtime",
                    "/usr/share/zoneinfo",
                    "/usr/share/X11/locale",
                    "/usr/share/locale",
                    "$CONFIG/plasma-localerc",
                ])
                .directories(&["/usr/lib/locale"])
                .binaries(&["locale"]),
        );
    }

    if features.include {
        out.push(
            Profile::new("include")
                .ro_binds(&["/usr/include", "/usr/local/include"])
                .directories(&["/usr/lib/clang", "/usr/lib/gcc"]),
        );
    }

    if let Some(version) = &features.python {
        let python = format!("python{version}");
        let mut profile = Profile::new("python");
        profile.binaries.push(python.clone());
        profile.libraries.push(format!("lib{python}*"));
        profile.directories.push(format!("/usr/lib/{python}"));
        out.push(profile);
    }

    if features.shell {
        out.push(Profile::new("shell").binaries(&["/usr/bin/sh"]));
    }

    if features.xdg_open {
        let mut profile = Profile::new("xdg-open").binaries(&["/usr/bin/sb-open"]);
        profile
            .symlinks
            .push(("/usr/bin/sb-open".to_string(), "/usr/bin/xdg-open".to_string()));
        out.push(profile);
    }

    if features.hardened_malloc {
        out.push(
            Profile::new("hardened-malloc")
                .libraries(&["/usr/lib/libhardened_malloc.so"])
                .env(&[("LD_PRELOAD", "/usr/lib/libhardened_malloc.so")]),
        );
    }

    if share.contains(&Namespace::Net) {
        out.push(
            Profile::new("net")
                .ro_binds(&[
                    "/etc/gai.conf",
                    "/etc/hosts.conf",
                    "/etc/hosts",
                    "/etc/nsswitch.conf",
                    "/etc/resolv.conf",
                    "/etc/gnutls",
                    "/etc/ca-certificates",
                    "/usr/share/ca-certificates",
                    "/etc/pki",
                    "/usr/share/pki",
                    "/etc/ssl",
                    "/usr/share/ssl",
                ])
                .libraries(&["libnss*"]),
        );
    }

    out
}

fn gui_profile() -> Profile {
    Profile::new("gui")
        .dev_binds(&["/dev/dri"])
        .ro_binds(&[
            "/sys/devices/pci0000:00",
            "/sys/dev/char",
            "/usr/share/glvnd",
            "/usr/share/libdrm",
            "/usr/share/fontconfig",
            "/etc/fonts",
            "$CONFIG/fontconfig",
            "$DATA/fontconfig",
            "/usr/share/fonts",
            "$HOME/.fonts",
            "/usr/share/themes",
            "/usr/share/color-schemes",
            "/usr/share/icons",
            "/usr/share/cursors",
            "/usr/share/pixmaps",
            "$DATA/pixmaps",
            "/usr/share/mime",
            "$DATA/mime",
            "$RUNTIME/wayland-0",
            "/usr/share/X11/xkb",
        ])
        .env(&[("XDG_SESSION_TYPE", "wayland"), ("WAYLAND_DISPLAY", "wayland-0")])
        .directories(&["/usr/lib/dri", "/usr/lib/gbm"])
        .libraries(&["*Mesa*", "*mesa*", "*EGL*", "libva-drm*", "libva-wayland*", "libva.so*"])
}

fn gtk_profile(version: GtkVersion) -> Profile {
    let mut profile = Profile::new("gtk")
        .ro_binds(&[
            "/usr/share/gtk",
            "$CONFIG/gtkrc",
            "/usr/share/glib-2.0",
            "/usr/share/gtk-2.0",
            "$HOME/.gtkrc-2.0",
            "$CONFIG/gtkrc-2.0",
            "$CONFIG/gtk-2.0",
        ])
        .env(&[("GTK_USE_PORTAL", "1"), ("GTK_A11Y", "none")]);

    if matches!(version, GtkVersion::Gtk3 | GtkVersion::All) {
        profile = profile
            .ro_binds(&["$CONFIG/gtk-3.0", "/usr/share/gtk-3.0", "/etc/xdg/gtk-3.0"])
            .directories(&["/usr/lib/gtk-3.0"])
            .libraries(&["libgdk-3*", "libgtk-3*"]);
    }
    if matches!(version, GtkVersion::Gtk4 | GtkVersion::All) {
        profile = profile
            .ro_binds(&["/usr/share/gtk-4.0", "$CONFIG/gtk-4.0"])
            .directories(&["/usr/lib/gtk-4.0"])
            .libraries(&["libgdk-4*", "libgtk-4*"]);
    }
    profile
}

fn qt_profile(version: QtVersion) -> Profile {
    let mut profile = Profile::new("qt").ro_binds(&[
        "$CONFIG/kdedefaults",
        "$CONFIG/breezerc",
        "$CONFIG/kdeglobals",
        "$CONFIG/Trolltech.conf",
        "$CONFIG/kde.org",
    ]);

    let qt = match version {
        QtVersion::Qt5 => "5",
        QtVersion::Qt6 => "6",
        QtVersion::Kf6 => {
            profile = profile
                .directories(&["/usr/lib/kf6"])
                .libraries(&["*Kirigami*", "libKF6*", "/usr/lib/kf6/kioworker"]);
            "6"
        }
    };
    profile.ro_binds.push(format!("/usr/share/qt{qt}"));
    profile.directories.push(format!("/usr/lib/qt{qt}"));
    profile.libraries.push(format!("libQt{qt}*"));
    profile
}

/// Host directories referenced by profile paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDirs {
    pub home: String,
    pub config: String,
    pub data: String,
    pub runtime: String,
}

impl HostDirs {
    pub fn detect() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let config = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        let data = dirs::data_dir().unwrap_or_else(|| home.join(".local/share"));
        let runtime = dirs::runtime_dir().unwrap_or_else(|| PathBuf::from("/run/user"));
        let text = |p: PathBuf| p.to_string_lossy().trim_end_matches('/').to_string();
        Self {
            home: text(home),
            config: text(config),
            data: text(data),
            runtime: text(runtime),
        }
    }

    /// Replace a leading `$HOME`, `$CONFIG`, `$DATA` or `$RUNTIME`.
    pub fn expand(&self, path: &str) -> String {
        let vars = [
            ("$HOME", &self.home),
            ("$CONFIG", &self.config),
            ("$DATA", &self.data),
            ("$RUNTIME", &self.runtime),
        ];
        for (var, value) in vars {
            if let Some(rest) = path.strip_prefix(var) {
                return format!("{value}{rest}");
            }
        }
        path.to_string()
    }

    /// Where a host path appears in the sandbox; the home directory moves
    /// to `/home/sb`.
    pub fn sandbox_path(&self, path: &str) -> String {
        match path.strip_prefix(self.home.as_str()) {
            Some(rest) if !self.home.is_empty() && (rest.is_empty() || rest.starts_with('/')) => {
                format!("/home/sb{rest}")
            }
            _ => path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(profiles: &[Profile]) -> Vec<&'static str> {
        profiles.iter().map(|p| p.name).collect()
    }

    #[test]
    fn nothing_enabled() {
        let share = BTreeSet::from([Namespace::None]);
        assert!(profiles(&Features::default(), &share).is_empty());
    }

    #[test]
    fn toolkits_imply_gui() {
        let share = BTreeSet::new();
        let features = Features {
            qt: Some(QtVersion::Qt6),
            vulkan: true,
            ..Features::default()
        };
        let found = profiles(&features, &share);
        assert_eq!(names(&found), vec!["qt", "vulkan", "gui"]);
        assert!(found[0].libraries.contains(&"libQt6*".to_string()));
    }

    #[test]
    fn electron_implies_gtk3() {
        let features = Features {
            electron: Some("32".to_string()),
            ..Features::default()
        };
        let found = profiles(&features, &BTreeSet::new());
        assert_eq!(names(&found), vec!["electron", "gtk", "gui"]);
        assert!(found[0].binaries.contains(&"/usr/bin/electron32".to_string()));
        assert!(found[0].proc && found[0].user_namespace);
        assert!(found[1].directories.contains(&"/usr/lib/gtk-3.0".to_string()));
        assert!(!found[1].directories.contains(&"/usr/lib/gtk-4.0".to_string()));
    }

    #[test]
    fn kf6_pulls_frameworks() {
        let found = qt_profile(QtVersion::Kf6);
        assert!(found.directories.contains(&"/usr/lib/kf6".to_string()));
        assert!(found.directories.contains(&"/usr/lib/qt6".to_string()));
        assert!(found.libraries.contains(&"libKF6*".to_string()));
    }

    #[test]
    fn net_share_adds_resolver_config() {
        let share = BTreeSet::from([Namespace::Net]);
        let found = profiles(&Features::default(), &share);
        assert_eq!(names(&found), vec!["net"]);
        assert!(found[0].libraries.contains(&"libnss*".to_string()));
    }

    #[test]
    fn host_dirs_expand_and_remap() {
        let host = HostDirs {
            home: "/home/alice".to_string(),
            config: "/home/alice/.config".to_string(),
            data: "/home/alice/.local/share".to_string(),
            runtime: "/run/user/1000".to_string(),
        };
        assert_eq!(host.expand("$CONFIG/gtk-3.0"), "/home/alice/.config/gtk-3.0");
        assert_eq!(host.expand("$RUNTIME/wayland-0"), "/run/user/1000/wayland-0");
        assert_eq!(host.expand("/etc/fonts"), "/etc/fonts");
        assert_eq!(host.sandbox_path("/home/alice/.fonts"), "/home/sb/.fonts");
        assert_eq!(host.sandbox_path("/home/alicex/f"), "/home/alicex/f");
        assert_eq!(host.sandbox_path("/etc/hosts"), "/etc/hosts");
    }
}
