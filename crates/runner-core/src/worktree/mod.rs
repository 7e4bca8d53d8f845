//! Git worktree management for node isolation (component F).
//!
//! Each plan node runs in its own git worktree, checked out to a branch
//! named deterministically from the node's UUID. Worktrees share the object
//! store of the main repository but have independent working directories
//! and index files, so concurrent nodes never contend on the main checkout.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::model::NodeId;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(
        "worktree path exists but has unexpected branch: expected {expected}, found {found}"
    )]
    BranchMismatch { expected: String, found: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Result of an ordinary (non-delegated) merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict { details: String },
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages git worktrees for node isolation.
///
/// Git serialises mutating worktree operations on the same repository via a
/// lock file on the shared object store; this manager additionally
/// serialises them through an internal mutex so concurrent node executors
/// in this process don't race each other before even reaching git.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_root: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_root: self.worktree_root.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a new `WorktreeManager`.
    ///
    /// `worktree_root` is the directory under which per-node worktrees are
    /// placed (`<repo>/.orchestrator/worktrees` by convention, per §6.2).
    /// Ensures the worktree root and `.orchestrator/` are excluded from the
    /// VCS via `.git/info/exclude`, which does not require modifying the
    /// tracked `.gitignore`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_root: PathBuf,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let git_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let manager = Self {
            repo_path,
            worktree_root,
            git_lock: Arc::new(Mutex::new(())),
        };
        manager.ensure_excluded(&git_dir);
        Ok(manager)
    }

    fn ensure_excluded(&self, git_dir: &str) {
        let exclude_path = self.repo_path.join(git_dir).join("info").join("exclude");
        let Some(parent) = exclude_path.parent() else {
            return;
        };
        let _ = std::fs::create_dir_all(parent);
        let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
        if existing.contains(".orchestrator/") {
            return;
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(".orchestrator/\n");
        if let Err(e) = std::fs::write(&exclude_path, updated) {
            tracing::warn!(error = %e, "failed to update git exclude file");
        }
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Build the deterministic branch name for a node.
    ///
    /// Never collides with a user branch: the `plan-runner/` prefix plus a
    /// UUID is not a name a human would pick, and is unique per node.
    pub fn branch_name(node_id: NodeId) -> String {
        format!("plan-runner/{}", node_id.0)
    }

    /// The on-disk path for a node's worktree, under the worktree root.
    pub fn worktree_path(&self, node_id: NodeId) -> PathBuf {
        self.worktree_root.join(node_id.0.to_string())
    }

    /// Create (or reuse) the worktree for a node, branched from
    /// `base_branch`.
    ///
    /// Prefers the fetched remote tip (`origin/<base_branch>`) when a
    /// remote named `origin` exists and the fetch succeeds; otherwise
    /// branches from the local tip. Idempotent: if a worktree already
    /// exists at the expected path with the expected branch, it is reused.
    pub fn create(
        &self,
        node_id: NodeId,
        base_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let branch_name = Self::branch_name(node_id);
        let worktree_path = self.worktree_path(node_id);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            match &existing.branch {
                Some(branch) if branch == &branch_name => {
                    tracing::info!(node_id = %node_id.0, "reusing existing worktree");
                    return Ok(existing);
                }
                Some(branch) => {
                    return Err(WorktreeError::BranchMismatch {
                        expected: branch_name,
                        found: branch.clone(),
                    });
                }
                None => return Ok(existing),
            }
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create worktree root: {}", parent.display()),
                source: e,
            })?;
        }

        let start_point = self.resolve_start_point(base_branch);
        let branch_exists = self.branch_exists(&branch_name)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(&branch_name)
                .current_dir(&self.repo_path)
                .output()
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b", &branch_name])
                .arg(&worktree_path)
                .arg(&start_point)
                .current_dir(&self.repo_path)
                .output()
        }
        .map_err(|e| WorktreeError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Best-effort `git fetch origin <base_branch>`; returns the ref to
    /// branch from (`origin/<base_branch>` on success, `<base_branch>`
    /// otherwise).
    fn resolve_start_point(&self, base_branch: &str) -> String {
        let has_origin = Command::new("git")
            .args(["remote", "get-url", "origin"])
            .current_dir(&self.repo_path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !has_origin {
            return base_branch.to_string();
        }

        let fetched = Command::new("git")
            .args(["fetch", "origin", base_branch])
            .current_dir(&self.repo_path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if fetched {
            let remote_ref = format!("origin/{base_branch}");
            let exists = Command::new("git")
                .args(["rev-parse", "--verify", &remote_ref])
                .current_dir(&self.repo_path)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if exists {
                return remote_ref;
            }
        }

        base_branch.to_string()
    }

    /// Returns whether a path currently holds a valid, VCS-consistent
    /// worktree (used by the scheduler's reuse check before re-creating).
    pub fn reuse(&self, path: &Path) -> bool {
        self.find_worktree_by_path(path).is_ok() && path.exists()
    }

    /// Remove a worktree by path. Idempotent and tolerant of concurrent
    /// external deletion: never returns an error for an already-gone
    /// worktree, only logs a warning.
    pub fn destroy(&self, path: &Path, branch: Option<&str>) {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(path = %path.display(), "worktree directory present but unregistered, removing");
                let _ = std::fs::remove_dir_all(path);
            }
        } else {
            let output = Command::new("git")
                .args(["worktree", "remove", "--force"])
                .arg(path)
                .current_dir(&self.repo_path)
                .output();
            match output {
                Ok(o) if !o.status.success() => {
                    let stderr = String::from_utf8_lossy(&o.stderr);
                    if !stderr.contains("is not a working tree") {
                        tracing::warn!(path = %path.display(), %stderr, "worktree remove failed");
                    }
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "worktree remove command failed"),
                _ => {}
            }
        }

        if let Some(branch) = branch {
            let _ = self.delete_branch(branch);
        }
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Merge `branch_name` into the branch currently checked out in
    /// `checkout_dir` (a dedicated merge worktree, per §4.4 -- never the
    /// main checkout). On conflict, the merge is aborted automatically.
    pub fn merge_branch_in(
        &self,
        checkout_dir: &Path,
        branch_name: &str,
        message: &str,
    ) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["merge", "--no-ff", branch_name, "-m", message])
            .current_dir(checkout_dir)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git merge".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(MergeResult::Success);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed")
        {
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(checkout_dir)
                .output();

            return Ok(MergeResult::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(WorktreeError::GitExit {
            command: "merge".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// Abort any in-progress merge in `checkout_dir` (used when cancellation
    /// races a merge, per §5).
    pub fn abort_merge_in(&self, checkout_dir: &Path) {
        let _ = Command::new("git")
            .args(["merge", "--abort"])
            .current_dir(checkout_dir)
            .output();
    }

    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// Current HEAD commit sha of a worktree directory.
    pub fn head_commit(&self, dir: &Path) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse HEAD".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "rev-parse HEAD".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let status = Command::new("git")
            .args(["init"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git init");
        assert!(status.status.success(), "git init failed");

        let _ = Command::new("git")
            .args(["config", "user.email", "test@plan-runner.dev"])
            .current_dir(&repo_path)
            .output();
        let _ = Command::new("git")
            .args(["config", "user.name", "Plan Runner Test"])
            .current_dir(&repo_path)
            .output();

        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        let _ = Command::new("git")
            .args(["add", "."])
            .current_dir(&repo_path)
            .output();
        let status = Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git commit");
        assert!(status.status.success(), "git commit failed");

        let _ = Command::new("git")
            .args(["branch", "-M", "main"])
            .current_dir(&repo_path)
            .output();

        (dir, repo_path)
    }

    #[test]
    fn new_with_valid_repo() {
        let (_dir, repo_path) = create_temp_repo();
        let root = repo_path.join(".orchestrator/worktrees");
        let mgr = WorktreeManager::new(&repo_path, root);
        assert!(mgr.is_ok());
    }

    #[test]
    fn new_with_invalid_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), dir.path().join("wt"));
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_name_is_deterministic_and_namespaced() {
        let id = NodeId(Uuid::nil());
        let name = WorktreeManager::branch_name(id);
        assert!(name.starts_with("plan-runner/"));
        assert_eq!(name, WorktreeManager::branch_name(id));
    }

    #[test]
    fn create_and_list_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let root = repo_path.join(".orchestrator/worktrees");
        let mgr = WorktreeManager::new(&repo_path, root).unwrap();

        let node_id = NodeId(Uuid::new_v4());
        let info = mgr.create(node_id, "main").expect("create failed");

        assert!(info.path.exists());
        assert_eq!(info.branch.as_deref(), Some(WorktreeManager::branch_name(node_id).as_str()));

        let worktrees = mgr.list_worktrees().unwrap();
        assert!(worktrees.len() >= 2);
    }

    #[test]
    fn create_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let root = repo_path.join(".orchestrator/worktrees");
        let mgr = WorktreeManager::new(&repo_path, root).unwrap();

        let node_id = NodeId(Uuid::new_v4());
        let info1 = mgr.create(node_id, "main").unwrap();
        let info2 = mgr.create(node_id, "main").unwrap();
        assert_eq!(info1.path, info2.path);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let root = repo_path.join(".orchestrator/worktrees");
        let mgr = WorktreeManager::new(&repo_path, root).unwrap();

        let node_id = NodeId(Uuid::new_v4());
        let info = mgr.create(node_id, "main").unwrap();
        mgr.destroy(&info.path, None);
        assert!(!info.path.exists());
        // Second destroy must not panic or error.
        mgr.destroy(&info.path, None);
    }

    #[test]
    fn merge_branch_success() {
        let (_dir, repo_path) = create_temp_repo();
        let root = repo_path.join(".orchestrator/worktrees");
        let mgr = WorktreeManager::new(&repo_path, root).unwrap();

        let node_id = NodeId(Uuid::new_v4());
        let info = mgr.create(node_id, "main").unwrap();
        std::fs::write(info.path.join("feature.txt"), "new feature\n").unwrap();
        let run = |args: &[&str], dir: &Path| {
            let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
            assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        };
        run(&["add", "feature.txt"], &info.path);
        run(&["commit", "-m", "add feature"], &info.path);
        mgr.destroy(&info.path, None);

        let branch = WorktreeManager::branch_name(node_id);
        let result = mgr.merge_branch_in(&repo_path, &branch, "merge test").unwrap();
        assert_eq!(result, MergeResult::Success);
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn parse_porcelain_output_handles_detached_and_no_trailing_newline() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/detached
HEAD 111222333444
detached";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch, None);
    }

    #[test]
    fn parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").unwrap().is_empty());
    }
}
