//! Shared test fixtures for plan runner integration tests.
//!
//! A `TestRepo` is a throwaway git repository with a root commit, suitable
//! as the `repoPath` for a [`RunnerConfig`] -- every crate that needs a real
//! git worktree (the worktree manager, the merge manager, the facade) was
//! hand-rolling this same `git init` + empty commit dance in its own test
//! module; this crate gives them one place to share it.

use std::path::Path;

use runner_core::config::RunnerConfig;

pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    /// Initialize a fresh git repository with an empty root commit on
    /// whichever branch `git init` defaults to.
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "root"]);
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolve a [`RunnerConfig`] for this repository, with the global
    /// capacity registry's storage directory pointed inside the temp dir so
    /// tests never touch the operator's real `~/.local/share/planrunner`.
    pub fn config(&self) -> RunnerConfig {
        let mut config = RunnerConfig::resolve(self.dir.path());
        config.global_storage_dir = self.dir.path().join("global");
        config
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn run_git(repo_path: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(output.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
}
