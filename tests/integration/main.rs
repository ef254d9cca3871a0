//! Integration tests for sb

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn sb() -> Command {
        cargo_bin_cmd!("sb")
    }

    /// A config pointing every path and tool into a scratch directory,
    /// with an `ldd` that reports a single missing library.
    struct Scratch {
        dir: TempDir,
    }

    impl Scratch {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let scratch = Self { dir };

            let ldd = scratch.path("ldd");
            std::fs::write(
                &ldd,
                "#!/bin/sh\nprintf '\\tlibgone.so.1 => /nonexistent/libgone.so.1 (0x0)\\n'\n",
            )
            .unwrap();
            std::fs::set_permissions(&ldd, std::fs::Permissions::from_mode(0o755)).unwrap();

            let program = scratch.path("bin/hello");
            std::fs::create_dir_all(program.parent().unwrap()).unwrap();
            std::fs::write(&program, [0x7f, b'E', b'L', b'F', 2, 1, 1, 0]).unwrap();
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

            let config = format!(
                "[paths]\nstore = \"{}\"\ndata_dir = \"{}\"\n\n[tools]\nldd = \"{}\"\n",
                scratch.path("store").display(),
                scratch.path("data").display(),
                ldd.display()
            );
            std::fs::write(scratch.config(), config).unwrap();
            scratch
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn config(&self) -> PathBuf {
            self.path("config.toml")
        }

        fn program(&self) -> String {
            self.path("bin/hello").to_string_lossy().into_owned()
        }

        fn cmd(&self) -> Command {
            let mut cmd = sb();
            cmd.arg("--config").arg(self.config()).env_remove("RUST_LOG");
            cmd
        }
    }

    #[test]
    fn help_displays() {
        sb().arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Minimal bubblewrap sandboxes"));
    }

    #[test]
    fn version_displays() {
        sb().arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("sb"));
    }

    #[test]
    fn config_path_honors_flag() {
        let scratch = Scratch::new();
        scratch
            .cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let scratch = Scratch::new();
        scratch
            .cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[paths]").and(predicate::str::contains("[tools]")));
    }

    #[test]
    fn config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        sb().arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("log_format"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[paths\nstore = 1").unwrap();
        sb().arg("--config")
            .arg(&path)
            .args(["cache", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn run_dry_prints_command() {
        let scratch = Scratch::new();
        scratch
            .cmd()
            .args(["run", "--dry", &scratch.program(), "--", "world"])
            .assert()
            .success()
            .stdout(
                predicate::str::starts_with("bwrap --new-session")
                    .and(predicate::str::contains(format!(
                        "--ro-bind {} /usr/bin/hello",
                        scratch.program()
                    )))
                    .and(predicate::str::contains("--unshare-all"))
                    .and(predicate::str::contains("--tmp-overlay /usr/lib"))
                    .and(predicate::str::ends_with("/usr/bin/hello world\n")),
            );

        assert!(scratch.path("data/apps/hello/cmd.cache").exists());
        assert!(scratch.path("data/apps/hello/lib.cache").exists());
    }

    #[test]
    fn second_run_reuses_cached_command() {
        let scratch = Scratch::new();
        let first = scratch
            .cmd()
            .args(["run", "--dry", &scratch.program()])
            .assert()
            .success();
        let first = String::from_utf8(first.get_output().stdout.clone()).unwrap();

        scratch
            .cmd()
            .args(["-v", "run", "--dry", &scratch.program()])
            .assert()
            .success()
            .stdout(predicate::eq(first.as_str()))
            .stderr(predicate::str::contains("reused"));
    }

    #[test]
    fn run_unknown_program_fails() {
        let scratch = Scratch::new();
        scratch
            .cmd()
            .args(["run", "--dry", "/nonexistent/bin/nothing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Could not locate binary"));
    }

    #[test]
    fn resolve_prints_json() {
        let scratch = Scratch::new();
        scratch
            .cmd()
            .args(["resolve", "--format", "json", &scratch.program()])
            .assert()
            .success()
            .stdout(
                predicate::str::contains("\"binaries\"")
                    .and(predicate::str::contains(scratch.program())),
            );
    }

    #[test]
    fn cache_list_and_clear() {
        let scratch = Scratch::new();
        scratch
            .cmd()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached applications"));

        scratch
            .cmd()
            .args(["run", "--dry", &scratch.program()])
            .assert()
            .success();
        scratch
            .cmd()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"hello\""));

        scratch
            .cmd()
            .args(["cache", "clear", "hello"])
            .assert()
            .success();
        assert!(!Path::new(&scratch.path("data/apps/hello")).exists());
    }

    #[test]
    fn cache_clear_needs_a_target() {
        sb().args(["cache", "clear"]).assert().failure();
    }
}
