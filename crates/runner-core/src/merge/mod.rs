//! Merge Manager (component G, §4.4): incremental leaf delivery into the
//! plan's target branch, with a delegated conflict-resolution path.
//!
//! Grounded on `worktree::WorktreeManager::merge_branch_in`/`abort_merge_in`
//! for the mechanics (ordinary merge, abort-on-conflict) and on an
//! `orchestrator` pump loop's "serialize per plan, fall back to a
//! reconciliation pass" shape, generalized from task completion to
//! leaf-node delivery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::NodeId;
use crate::worktree::{MergeResult, WorktreeError, WorktreeManager};

pub const CONFLICT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPreference {
    Ours,
    Theirs,
}

/// Delegate invoked on merge conflict (§4.4.1). The concrete implementation
/// (an `Agent`-kind `WorkSpec` spawn, see `executor`) stages the conflicted
/// tree and commits with the supplied message; the runner never interprets
/// its reasoning, only its exit code.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        checkout_dir: &std::path::Path,
        branch_name: &str,
        target_branch: &str,
        message: &str,
        prefer: ConflictPreference,
    ) -> Result<bool, String>;
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("RI merge failed: conflict merging {branch}")]
    UnresolvedConflict { branch: String, details: String },

    #[error("conflict resolver timed out after {0:?}")]
    ResolverTimeout(Duration),

    #[error("conflict resolver failed: {0}")]
    ResolverFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    AlreadyMerged,
}

/// Serializes leaf delivery per target branch (across plans sharing one)
/// and drives each merge through a dedicated checkout, never the user's
/// main working copy.
pub struct MergeManager {
    worktrees: Arc<WorktreeManager>,
    merge_checkouts_root: PathBuf,
    branch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    prefer: ConflictPreference,
}

impl MergeManager {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        merge_checkouts_root: PathBuf,
        resolver: Option<Arc<dyn ConflictResolver>>,
        prefer: ConflictPreference,
    ) -> Self {
        Self {
            worktrees,
            merge_checkouts_root,
            branch_locks: Mutex::new(HashMap::new()),
            resolver,
            prefer,
        }
    }

    async fn lock_for(&self, target_branch: &str) -> Arc<Mutex<()>> {
        let mut locks = self.branch_locks.lock().await;
        locks
            .entry(target_branch.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn checkout_dir(&self, target_branch: &str) -> PathBuf {
        self.merge_checkouts_root.join(sanitize_branch(target_branch))
    }

    /// Ensure a dedicated merge worktree checked out to `target_branch`
    /// exists; reuse it across deliveries to the same branch.
    fn ensure_checkout(&self, target_branch: &str) -> Result<PathBuf, MergeError> {
        let dir = self.checkout_dir(target_branch);
        if self.worktrees.reuse(&dir) {
            return Ok(dir);
        }
        // The checkout worktree is keyed by target branch name, not a node
        // id, so it is created directly rather than through
        // `WorktreeManager::create` (which seeds from a node UUID).
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let output = std::process::Command::new("git")
            .args(["worktree", "add"])
            .arg(&dir)
            .arg(target_branch)
            .current_dir(self.worktrees.repo_path())
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add for merge checkout".into(),
                source: e,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree add (merge checkout)".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            }
            .into());
        }
        Ok(dir)
    }

    /// Deliver one leaf node's branch into `target_branch` (§4.4 "Leaf
    /// delivery"). Serialized per target branch across plans.
    pub async fn deliver_leaf(
        &self,
        node_id: NodeId,
        node_name: &str,
        plan_id: &str,
        target_branch: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let lock = self.lock_for(target_branch).await;
        let _guard = lock.lock().await;

        let checkout_dir = self.ensure_checkout(target_branch)?;
        // Always return to the branch tip before merging; a prior delivery
        // may have left the checkout mid-merge if the process crashed.
        self.worktrees.abort_merge_in(&checkout_dir);

        let branch_name = WorktreeManager::branch_name(node_id);
        let message = format!("Merge {node_name} from plan {plan_id}");

        let result = self
            .worktrees
            .merge_branch_in(&checkout_dir, &branch_name, &message)?;

        match result {
            MergeResult::Success => Ok(MergeOutcome::Merged),
            MergeResult::Conflict { details } => {
                self.resolve_conflict(&checkout_dir, &branch_name, target_branch, &message, details)
                    .await
            }
        }
    }

    async fn resolve_conflict(
        &self,
        checkout_dir: &std::path::Path,
        branch_name: &str,
        target_branch: &str,
        message: &str,
        details: String,
    ) -> Result<MergeOutcome, MergeError> {
        let Some(resolver) = &self.resolver else {
            return Err(MergeError::UnresolvedConflict {
                branch: branch_name.to_string(),
                details,
            });
        };

        let resolved = tokio::time::timeout(
            CONFLICT_RESOLUTION_TIMEOUT,
            resolver.resolve(checkout_dir, branch_name, target_branch, message, self.prefer),
        )
        .await;

        match resolved {
            Err(_) => {
                self.worktrees.abort_merge_in(checkout_dir);
                Err(MergeError::ResolverTimeout(CONFLICT_RESOLUTION_TIMEOUT))
            }
            Ok(Err(e)) => {
                self.worktrees.abort_merge_in(checkout_dir);
                Err(MergeError::ResolverFailed(e))
            }
            Ok(Ok(false)) => {
                self.worktrees.abort_merge_in(checkout_dir);
                Err(MergeError::UnresolvedConflict {
                    branch: branch_name.to_string(),
                    details,
                })
            }
            Ok(Ok(true)) => Ok(MergeOutcome::Merged),
        }
    }
}

fn sanitize_branch(branch: &str) -> String {
    branch.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn run(args: &[&str], dir: &std::path::Path) {
        let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    }

    fn init_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        run(&["init"], &path);
        run(&["config", "user.email", "t@t.dev"], &path);
        run(&["config", "user.name", "t"], &path);
        std::fs::write(path.join("README.md"), "hi\n").unwrap();
        run(&["add", "."], &path);
        run(&["commit", "-m", "init"], &path);
        run(&["branch", "-M", "main"], &path);
        (dir, path)
    }

    #[tokio::test]
    async fn deliver_leaf_merges_cleanly() {
        let (_dir, repo_path) = init_repo();
        let wt = Arc::new(WorktreeManager::new(&repo_path, repo_path.join(".orchestrator/worktrees")).unwrap());
        let node_id = NodeId(Uuid::new_v4());
        let info = wt.create(node_id, "main").unwrap();
        std::fs::write(info.path.join("feature.txt"), "feature\n").unwrap();
        run(&["add", "feature.txt"], &info.path);
        run(&["commit", "-m", "add feature"], &info.path);
        wt.destroy(&info.path, None);

        let mgr = MergeManager::new(
            Arc::clone(&wt),
            repo_path.join(".orchestrator/merge-checkouts"),
            None,
            ConflictPreference::Ours,
        );

        let outcome = mgr.deliver_leaf(node_id, "node-a", "plan-1", "main").await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo_path.join("feature.txt").exists() || mgr.checkout_dir("main").join("feature.txt").exists());
    }

    #[tokio::test]
    async fn conflict_without_resolver_surfaces_error() {
        let (_dir, repo_path) = init_repo();
        std::fs::write(repo_path.join("shared.txt"), "base\n").unwrap();
        run(&["add", "shared.txt"], &repo_path);
        run(&["commit", "-m", "add shared"], &repo_path);

        let wt = Arc::new(WorktreeManager::new(&repo_path, repo_path.join(".orchestrator/worktrees")).unwrap());
        let node_id = NodeId(Uuid::new_v4());
        let info = wt.create(node_id, "main").unwrap();
        std::fs::write(info.path.join("shared.txt"), "from node\n").unwrap();
        run(&["commit", "-am", "node edit"], &info.path);
        wt.destroy(&info.path, None);

        // Conflicting edit lands on target branch after the node branched.
        std::fs::write(repo_path.join("shared.txt"), "from main\n").unwrap();
        run(&["commit", "-am", "main edit"], &repo_path);

        let mgr = MergeManager::new(
            Arc::clone(&wt),
            repo_path.join(".orchestrator/merge-checkouts"),
            None,
            ConflictPreference::Ours,
        );

        let err = mgr.deliver_leaf(node_id, "node-a", "plan-1", "main").await.unwrap_err();
        assert!(matches!(err, MergeError::UnresolvedConflict { .. }));
    }
}
