//! External tool invocation (ldd, find, bwrap)

use crate::config::schema::ToolsConfig;
use crate::error::{SbError, SbResult};
use crate::util;
use std::collections::BTreeSet;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Programs used for dependency discovery and sandbox launch
#[derive(Debug, Clone)]
pub struct Tools {
    pub ldd: String,
    pub find: String,
    pub bwrap: String,
    pub timeout: Duration,
}

impl Default for Tools {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default())
    }
}

impl Tools {
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            ldd: config.ldd.clone(),
            find: config.find.clone(),
            bwrap: config.bwrap.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    /// Run a program to completion, capturing its output.
    async fn capture(&self, program: &str, args: &[&str]) -> SbResult<Output> {
        let rendered = format!("{} {}", program, args.join(" "));
        debug!("Executing: {}", rendered);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| SbError::command_failed(rendered, e)),
            Err(_) => Err(SbError::ToolTimeout {
                command: rendered,
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Ask the dynamic loader for the shared objects `path` links against.
    pub async fn ldd(&self, path: &str) -> SbResult<String> {
        let output = self.capture(&self.ldd, &[path]).await?;
        if !output.status.success() {
            return Err(SbError::ToolFailed {
                command: format!("{} {}", self.ldd, path),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `find` rooted at `dir`.
    ///
    /// find exits non-zero when it meets unreadable entries but still
    /// reports what it could see, so the status is only logged.
    pub async fn find(&self, dir: &str, args: &[&str]) -> SbResult<BTreeSet<String>> {
        let mut argv = vec![dir];
        argv.extend_from_slice(args);
        let output = self.capture(&self.find, &argv).await?;
        if !output.status.success() {
            debug!(
                "find {} exited with {:?}: {}",
                dir,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Executable files and links directly inside `dir`.
    pub async fn list_directory(&self, dir: &str) -> SbResult<BTreeSet<String>> {
        self.find(dir, &["-maxdepth", "1", "-type", "f,l", "-executable"])
            .await
    }

    /// Expand a glob entity to the executable files and links it names.
    ///
    /// A pattern containing `/` is matched by basename inside its own
    /// directory, otherwise it is matched inside `default_dir`.
    pub async fn wildcard(
        &self,
        pattern: &str,
        default_dir: &str,
        extra: &[&str],
    ) -> SbResult<BTreeSet<String>> {
        self.glob(pattern, default_dir, extra, true).await
    }

    /// Like [`Tools::wildcard`], but regardless of the mode bits.
    ///
    /// Shared objects installed 0644 are still loaded by the dynamic
    /// linker, so anything that must match every library uses this.
    pub async fn matching(
        &self,
        pattern: &str,
        default_dir: &str,
        extra: &[&str],
    ) -> SbResult<BTreeSet<String>> {
        self.glob(pattern, default_dir, extra, false).await
    }

    async fn glob(
        &self,
        pattern: &str,
        default_dir: &str,
        extra: &[&str],
        executable: bool,
    ) -> SbResult<BTreeSet<String>> {
        let (dir, name) = if pattern.contains('/') {
            (util::dirname(pattern), util::basename(pattern))
        } else {
            (default_dir, pattern)
        };

        let mut args = vec!["-maxdepth", "1"];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["-type", "f,l"]);
        if executable {
            args.push("-executable");
        }
        args.extend_from_slice(&["-name", name]);
        self.find(dir, &args).await
    }

    /// Launch bubblewrap with the terminal attached, returning its exit code.
    pub async fn launch(&self, args: &[String]) -> SbResult<i32> {
        debug!("Launching: {} {}", self.bwrap, util::render_command(args));
        let status = Command::new(&self.bwrap)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| SbError::command_failed(&self.bwrap, e))?;

        Ok(status.code().unwrap_or(-1))
    }
}
