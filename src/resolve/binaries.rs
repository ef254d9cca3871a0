//! Binary resolution: ELF programs and the scripts that launch them

use super::script::{self, Substitution, VariableTable};
use super::{is_elf, lock, read_header, CacheKind, DependencySet, ResolverContext};
use crate::error::{SbError, SbResult};
use crate::pool;
use crate::util;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type Shared<T> = Arc<Mutex<T>>;

/// What a script token turned out to reference
enum Reference {
    Binary(String, DependencySet),
    Library(String),
}

impl ResolverContext {
    /// Resolve a program to every binary it needs, itself included.
    ///
    /// Shared libraries found along the way are added to `libraries`. Each
    /// binary is visited at most once per context, so a repeated request
    /// yields an empty set. Fails only when `program` cannot be located or a
    /// script's interpreter is missing.
    pub async fn resolve_binary(
        self: &Arc<Self>,
        program: &str,
        libraries: &mut DependencySet,
    ) -> SbResult<DependencySet> {
        let sink = Arc::new(Mutex::new(DependencySet::new()));
        let result = Arc::clone(self)
            .binary(program.to_string(), Arc::clone(&sink))
            .await;
        libraries.extend(std::mem::take(&mut *lock(&sink)));
        result
    }

    /// Find `path` on disk, trying the binary root and PATH for bare names.
    pub fn locate(&self, path: &str) -> SbResult<String> {
        let found = if path.contains('/') {
            let rebased = self.layout.rebase(path);
            let existing = [rebased.as_str(), path]
                .into_iter()
                .find(|p| Path::new(p).is_file())
                .ok_or_else(|| SbError::BinaryNotFound(path.to_string()))?;
            std::path::absolute(existing)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| existing.to_string())
        } else {
            let candidate = format!("{}/{}", self.layout.bin_dir(), path);
            if Path::new(&candidate).is_file() {
                candidate
            } else if self.layout.is_host() {
                which::which(path)
                    .map(|p| p.to_string_lossy().into_owned())
                    .map_err(|_| SbError::BinaryNotFound(path.to_string()))?
            } else {
                return Err(SbError::BinaryNotFound(path.to_string()));
            }
        };
        Ok(self.layout.normalize_binary(&found))
    }

    fn binary(
        self: Arc<Self>,
        path: String,
        libraries: Shared<DependencySet>,
    ) -> BoxFuture<'static, SbResult<DependencySet>> {
        async move {
            if path.is_empty() || !self.mark_searched(&path) {
                return Ok(DependencySet::new());
            }

            if path.contains("/lib/") {
                let found = self.resolve_library(&path).await;
                lock(&libraries).extend(found);
                return Ok(DependencySet::new());
            }

            let located = self.locate(&path)?;
            if located != path && !self.mark_searched(&located) {
                return Ok(DependencySet::from([located.as_str()]));
            }

            let header = read_header(&located, 4).await;
            if header.is_empty() {
                return Ok(DependencySet::new());
            }

            let mut required = DependencySet::new();
            if header.starts_with(b"#!") {
                required.extend(Arc::clone(&self).script(located.clone(), libraries).await?);
            } else if is_elf(&located).await {
                let found = self.resolve_library(&located).await;
                lock(&libraries).extend(found);
            }
            required.insert(located);
            Ok(required)
        }
        .boxed()
    }

    async fn script(
        self: Arc<Self>,
        path: String,
        libraries: Shared<DependencySet>,
    ) -> SbResult<DependencySet> {
        let mut required = DependencySet::new();

        if let Some(cached) = self.cache.load(CacheKind::Binary, &path).await {
            let handles: Vec<_> = cached
                .iter()
                .map(|entry| {
                    let ctx = Arc::clone(&self);
                    self.pool.submit(ctx.binary(entry.clone(), Arc::clone(&libraries)))
                })
                .collect();
            for handle in handles {
                match pool::join(handle).await {
                    Ok(Ok(found)) => required.extend(found),
                    Ok(Err(e)) => debug!("Stale cache entry for {}: {}", path, e),
                    Err(e) => warn!("Resolution task failed for {}: {}", path, e),
                }
            }
            // Entries removed since the cache was written are dropped
            required.extend(
                cached
                    .into_iter()
                    .filter(|e| !e.contains("/lib/") && Path::new(e).is_file()),
            );
            return Ok(required);
        }

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!("Cannot read script {}: {}", path, e);
                return Ok(required);
            }
        };
        let mut lines = contents.lines();

        // Direct references, which are what gets cached
        let mut local = DependencySet::new();
        let interpreter = lines.next().and_then(script::shebang).unwrap_or_default();

        // Only the interpreter itself is mandatory; env-style arguments are best effort
        for (i, word) in interpreter.iter().enumerate() {
            let located = match self.locate(word) {
                Ok(located) => located,
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    debug!("Ignoring interpreter argument {}: {}", word, e);
                    continue;
                }
            };
            local.insert(located.clone());
            match Arc::clone(&self).binary(located, Arc::clone(&libraries)).await {
                Ok(found) => required.extend(found),
                Err(e) if i == 0 => return Err(e),
                Err(e) => debug!("Ignoring interpreter argument {}: {}", word, e),
            }
        }

        if !script::is_python(&interpreter) {
            self.scan(lines, &mut local, &mut required, &libraries).await;
        }

        self.cache.store(CacheKind::Binary, &path, &local).await;
        required.extend(local.into_iter().filter(|e| !e.contains("/lib/")));
        Ok(required)
    }

    /// Scan script lines for the binaries and libraries they reference.
    async fn scan<'a>(
        self: &Arc<Self>,
        lines: impl Iterator<Item = &'a str>,
        local: &mut DependencySet,
        required: &mut DependencySet,
        libraries: &Shared<DependencySet>,
    ) {
        let mut variables = Arc::new(VariableTable::default());
        let discovered: Shared<HashSet<String>> = Arc::new(Mutex::new(HashSet::new()));
        let mut heredoc: Option<String> = None;

        for line in lines {
            let line = line.trim();
            if let Some(end) = &heredoc {
                if line == end {
                    heredoc = None;
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (code, terminator) = script::split_heredoc(line);
            heredoc = terminator;

            if let Some((key, value)) = script::assignment(code) {
                Arc::make_mut(&mut variables).assign(key, value);
            }

            let handles: Vec<_> = script::tokenize(code)
                .into_iter()
                .map(|token| {
                    let ctx = Arc::clone(self);
                    self.pool.submit(ctx.reference(
                        token,
                        Arc::clone(&variables),
                        Arc::clone(&discovered),
                        Arc::clone(libraries),
                    ))
                })
                .collect();

            for handle in handles {
                match pool::join(handle).await {
                    Ok(Some(Reference::Binary(binary, found))) => {
                        local.insert(binary);
                        required.extend(found);
                    }
                    Ok(Some(Reference::Library(library))) => {
                        local.insert(library);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Token task failed: {}", e),
                }
            }
        }
    }

    /// Decide whether a token names a binary or library and resolve it.
    async fn reference(
        self: Arc<Self>,
        token: String,
        variables: Arc<VariableTable>,
        discovered: Shared<HashSet<String>>,
        libraries: Shared<DependencySet>,
    ) -> Option<Reference> {
        if variables.contains(&token) || script::is_builtin(&token) {
            return None;
        }

        let token = if token.contains('$') {
            match variables.substitute(&token) {
                Substitution::Resolved(value) => value,
                Substitution::Partial(_) => return None,
                Substitution::Unsafe => {
                    debug!("Refusing to expand {}", token);
                    return None;
                }
            }
        } else {
            token
        };
        let token = token.trim();
        if token.is_empty() || token.starts_with('-') {
            return None;
        }

        let candidate = if token.starts_with('/') {
            let rebased = self.layout.rebase(token);
            if Path::new(&rebased).exists() {
                rebased
            } else {
                token.to_string()
            }
        } else if token.contains('/') {
            return None;
        } else {
            format!("{}/{}", self.layout.bin_dir(), token)
        };

        let meta = tokio::fs::metadata(&candidate).await.ok()?;
        if !meta.is_file() {
            return None;
        }

        if candidate.contains("/lib/") {
            let found = self.resolve_library(&candidate).await;
            lock(&libraries).extend(found);
            return Some(Reference::Library(candidate));
        }

        if !candidate.contains("/bin/") || meta.permissions().mode() & 0o111 == 0 {
            return None;
        }

        let binary = self.layout.normalize_binary(&candidate);
        if !lock(&discovered).insert(util::basename(&binary).to_string()) {
            return None;
        }

        match Arc::clone(&self).binary(binary.clone(), libraries).await {
            Ok(found) => Some(Reference::Binary(binary, found)),
            Err(e) => {
                debug!("Skipping {}: {}", binary, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::ResolutionCache;
    use crate::testing::Sysroot;

    #[tokio::test]
    async fn elf_binary_collects_libraries() {
        let mut root = Sysroot::new();
        let app = root.elf("usr/bin/app");
        root.elf("usr/lib/libfoo.so.1");
        root.ldd("usr/bin/app", &["/usr/lib/libfoo.so.1"]);

        let ctx = root.context(ResolutionCache::disabled());
        let mut libraries = DependencySet::new();
        let binaries = ctx.resolve_binary("app", &mut libraries).await.unwrap();

        assert_eq!(binaries, DependencySet::from([app.as_str()]));
        assert_eq!(libraries, DependencySet::from([root.path("usr/lib/libfoo.so.1").as_str()]));
    }

    #[tokio::test]
    async fn missing_program_is_fatal() {
        let root = Sysroot::new();
        let ctx = root.context(ResolutionCache::disabled());
        let err = ctx
            .resolve_binary("does-not-exist", &mut DependencySet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SbError::BinaryNotFound(name) if name == "does-not-exist"));
    }

    #[tokio::test]
    async fn repeated_requests_are_empty() {
        let root = Sysroot::new();
        root.elf("usr/bin/app");
        let ctx = root.context(ResolutionCache::disabled());

        let mut libraries = DependencySet::new();
        assert_eq!(ctx.resolve_binary("app", &mut libraries).await.unwrap().len(), 1);
        assert!(ctx.resolve_binary("app", &mut libraries).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn script_resolves_interpreter_and_commands() {
        let root = Sysroot::new();
        let sh = root.elf("usr/bin/sh");
        let ls = root.elf("usr/bin/ls");
        let cat = root.elf("usr/bin/cat");
        let script = root.script(
            "usr/bin/launch",
            "#!/usr/bin/sh\n# ls in a comment is ignored\nFOO=ls\n$FOO -la\ncat /etc/hostname | grep x\necho 'rm -rf'\n",
        );

        let ctx = root.context(ResolutionCache::disabled());
        let binaries = ctx
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();

        assert_eq!(
            binaries,
            DependencySet::from([sh.as_str(), ls.as_str(), cat.as_str(), script.as_str()])
        );
    }

    #[tokio::test]
    async fn variable_reuse_is_discovered_once() {
        let root = Sysroot::new();
        root.elf("usr/bin/sh");
        let ls = root.elf("usr/bin/ls");
        let script = root.script(
            "usr/bin/wrapper",
            &format!("#!/usr/bin/sh\nFOO={ls}\n$FOO -la\n${{FOO}}\n"),
        );

        let ctx = root.context(ResolutionCache::new(root.path("cache"), false));
        let binaries = ctx
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert!(binaries.contains(&ls));

        let cached = std::fs::read_to_string(
            ResolutionCache::new(root.path("cache"), false)
                .path(CacheKind::Binary, &script)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(cached.matches("/ls").count(), 1);
    }

    #[tokio::test]
    async fn command_substitution_is_never_expanded() {
        let root = Sysroot::new();
        root.elf("usr/bin/sh");
        let marker = root.path("ran");
        let script = root.script(
            "usr/bin/sneaky",
            &format!("#!/usr/bin/sh\nX=$(touch {marker})\n$X\n"),
        );

        let ctx = root.context(ResolutionCache::disabled());
        ctx.resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert!(!Path::new(&marker).exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_fatal() {
        let root = Sysroot::new();
        let script = root.script("usr/bin/orphan", "#!/usr/bin/nonexistent-shell\nls\n");

        let ctx = root.context(ResolutionCache::disabled());
        let err = ctx
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SbError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn env_arguments_are_best_effort() {
        let root = Sysroot::new();
        let env = root.elf("usr/bin/env");
        let bash = root.elf("usr/bin/bash");
        let script = root.script("usr/bin/tool", "#!/usr/bin/env bash\n");
        let broken = root.script("usr/bin/tool2", "#!/usr/bin/env nosuchshell\n");

        let ctx = root.context(ResolutionCache::disabled());
        let binaries = ctx
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert!(binaries.contains(&env));
        assert!(binaries.contains(&bash));

        let binaries = ctx
            .resolve_binary(&broken, &mut DependencySet::new())
            .await
            .unwrap();
        assert!(binaries.contains(&broken));
    }

    #[tokio::test]
    async fn python_scripts_are_not_scanned() {
        let root = Sysroot::new();
        let python = root.elf("usr/bin/python3");
        root.elf("usr/bin/ls");
        let script = root.script("usr/bin/pytool", "#!/usr/bin/python3\nimport os\nls = 1\n");

        let ctx = root.context(ResolutionCache::disabled());
        let binaries = ctx
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert_eq!(binaries, DependencySet::from([python.as_str(), script.as_str()]));
    }

    #[tokio::test]
    async fn heredoc_bodies_are_skipped() {
        let root = Sysroot::new();
        root.elf("usr/bin/sh");
        let cat = root.elf("usr/bin/cat");
        let ls = root.elf("usr/bin/ls");
        let script = root.script("usr/bin/doc", "#!/usr/bin/sh\ncat <<EOF\nls\nEOF\n");

        let ctx = root.context(ResolutionCache::disabled());
        let binaries = ctx
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert!(binaries.contains(&cat));
        assert!(!binaries.contains(&ls));
    }

    #[tokio::test]
    async fn cached_script_is_replayed() {
        let mut root = Sysroot::new();
        root.elf("usr/bin/sh");
        root.elf("usr/bin/ls");
        root.elf("usr/lib/libls.so");
        root.ldd("usr/bin/ls", &["/usr/lib/libls.so"]);
        let script = root.script("usr/bin/run-ls", "#!/usr/bin/sh\nls\n");
        let cache_dir = root.path("cache");

        let mut first_libs = DependencySet::new();
        let first = root
            .context(ResolutionCache::new(&cache_dir, false))
            .resolve_binary(&script, &mut first_libs)
            .await
            .unwrap();

        // A cache hit must not depend on the script text any more
        std::fs::write(&script, "#!/usr/bin/sh\n").unwrap();

        let mut second_libs = DependencySet::new();
        let second = root
            .context(ResolutionCache::new(&cache_dir, false))
            .resolve_binary(&script, &mut second_libs)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first_libs, second_libs);
        assert!(second_libs.contains(&root.path("usr/lib/libls.so")));
    }

    #[tokio::test]
    async fn replay_drops_binaries_removed_since_caching() {
        let root = Sysroot::new();
        let sh = root.elf("usr/bin/sh");
        let tool = root.elf("usr/bin/tool");
        let script = root.script("usr/bin/run-tool", "#!/usr/bin/sh\ntool --go\n");
        let cache_dir = root.path("cache");

        let first = root
            .context(ResolutionCache::new(&cache_dir, false))
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert!(first.contains(&tool));

        std::fs::remove_file(&tool).unwrap();

        let second = root
            .context(ResolutionCache::new(&cache_dir, false))
            .resolve_binary(&script, &mut DependencySet::new())
            .await
            .unwrap();
        assert_eq!(second, DependencySet::from([sh.as_str(), script.as_str()]));
        assert!(second.iter().all(|p| Path::new(p).exists()));
    }

    #[tokio::test]
    async fn self_referencing_script_terminates() {
        let root = Sysroot::new();
        let path = root.path("usr/bin/selfref");
        let script = root.script("usr/bin/selfref", &format!("#!{path}\nselfref\n"));

        let ctx = root.context(ResolutionCache::disabled());
        let binaries = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            ctx.resolve_binary(&script, &mut DependencySet::new()),
        )
        .await
        .expect("resolution of a self-referencing script did not finish")
        .unwrap();
        assert_eq!(binaries, DependencySet::from([script.as_str()]));
    }

    #[tokio::test]
    async fn library_paths_route_to_library_resolution() {
        let mut root = Sysroot::new();
        let tool = root.elf("usr/lib/app/helper");
        root.ldd("usr/lib/app/helper", &[]);

        let ctx = root.context(ResolutionCache::disabled());
        let mut libraries = DependencySet::new();
        let binaries = ctx.resolve_binary(&tool, &mut libraries).await.unwrap();
        assert!(binaries.is_empty());
        assert!(libraries.contains(&tool));
    }
}
