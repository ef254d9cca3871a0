//! Test fixtures: a throwaway system tree with a scripted `ldd`

use crate::exec::Tools;
use crate::pool::WorkerPool;
use crate::resolve::{Layout, ResolutionCache, ResolverContext};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Sysroot {
    pub temp: TempDir,
    pub layout: Layout,
    rules: Vec<(String, Vec<String>)>,
}

impl Sysroot {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("usr/lib")).unwrap();
        std::fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        std::fs::create_dir_all(temp.path().join("tools")).unwrap();
        let layout = Layout::with_root(temp.path());
        Self {
            temp,
            layout,
            rules: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Absolute path of `rel` inside the tree.
    pub fn path(&self, rel: &str) -> String {
        self.temp
            .path()
            .join(rel.trim_start_matches('/'))
            .to_string_lossy()
            .into_owned()
    }

    pub fn file(&self, rel: &str, content: &str, mode: u32) -> String {
        let path = self.path(rel);
        if let Some(parent) = Path::new(&path).parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    /// An executable whose header marks it as ELF.
    pub fn elf(&self, rel: &str) -> String {
        let path = self.file(rel, "", 0o755);
        let mut bytes = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        bytes.extend_from_slice(rel.as_bytes());
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn script(&self, rel: &str, body: &str) -> String {
        self.file(rel, body, 0o755)
    }

    pub fn symlink(&self, target: &str, rel: &str) -> String {
        let path = self.path(rel);
        std::os::unix::fs::symlink(target, &path).unwrap();
        path
    }

    /// Make the fake ldd report `deps` (host-style paths) for `rel`,
    /// replacing any earlier rule for it.
    pub fn ldd(&mut self, rel: &str, deps: &[&str]) {
        let file = self.path(rel);
        self.rules.retain(|(existing, _)| *existing != file);
        self.rules
            .push((file, deps.iter().map(|d| d.to_string()).collect()));
        self.write_ldd();
    }

    fn write_ldd(&self) {
        let mut body = format!(
            "#!/bin/sh\necho \"$1\" >> '{}'\ncase \"$1\" in\n",
            self.path("tools/ldd.log")
        );
        for (file, deps) in &self.rules {
            body.push_str(&format!("  '{file}')\n"));
            for dep in deps {
                let name = crate::util::basename(dep);
                body.push_str(&format!(
                    "    printf '\\t%s => %s (0x00007f0000000000)\\n' '{name}' '{dep}'\n"
                ));
            }
            body.push_str("    ;;\n");
        }
        body.push_str("  *)\n    echo 'not a dynamic executable' >&2\n    exit 1\n    ;;\nesac\n");
        self.file("tools/ldd", &body, 0o755);
    }

    /// Number of times the fake ldd ran.
    pub fn ldd_calls(&self) -> usize {
        std::fs::read_to_string(self.path("tools/ldd.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    pub fn tools(&self) -> Tools {
        if self.rules.is_empty() {
            self.write_ldd();
        }
        Tools {
            ldd: self.path("tools/ldd"),
            ..Tools::default()
        }
    }

    pub fn context(&self, cache: ResolutionCache) -> Arc<ResolverContext> {
        ResolverContext::new(self.layout.clone(), self.tools(), WorkerPool::new(4), cache)
    }
}
