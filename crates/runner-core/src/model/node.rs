//! Mutable per-node runtime state (§3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel commit id recorded for a successful node whose `work` produced
/// no changes under `expectsNoChanges` (invariant 5).
pub const NO_CHANGES_SENTINEL: &str = "NO_CHANGES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled
        )
    }
}

/// Status of a single phase within an attempt. `NotRun` is the default;
/// phases are populated in order as the executor advances (§5 ordering
/// guarantee (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotRun,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl Default for PhaseStatus {
    fn default() -> Self {
        PhaseStatus::NotRun
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseStatuses {
    pub precheck: PhaseStatus,
    pub work: PhaseStatus,
    pub postcheck: PhaseStatus,
    pub commit: PhaseStatus,
    #[serde(rename = "mergeRI")]
    pub merge_ri: PhaseStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_id: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_statuses: PhaseStatuses,
    pub log_file: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Mutable runtime state for a single node (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,
    /// Monotone counter, incremented on every observed mutation
    /// (invariant 2).
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub current_phase: Option<String>,
}

impl NodeState {
    pub fn new_pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            version: 0,
            attempts: Vec::new(),
            pid: None,
            session_id: None,
            base_commit: None,
            worktree_path: None,
            started_at: None,
            ended_at: None,
            error: None,
            failure_reason: None,
            current_phase: None,
        }
    }

    /// `AttemptRecord` currently in progress (or most recent), per
    /// invariant 3 ("the last record is currentAttempt").
    pub fn current_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut AttemptRecord> {
        self.attempts.last_mut()
    }
}
