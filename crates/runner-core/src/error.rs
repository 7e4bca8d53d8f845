//! Crate-wide error kinds (§7).
//!
//! Every externally observable operation returns a structured result (§9);
//! internal helpers may panic only on invariant violations, which are bugs.

use thiserror::Error;

use crate::model::{NodeId, PlanId};

/// The seven error kinds from §7, as a single enum so callers at the
/// facade boundary can match on `kind()`.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Rejected before any state is created; surfaced synchronously.
    #[error("validation error at {path}: {message}")]
    Validation { path: String, message: String },

    /// Worktree/capacity failures, retried with backoff before terminal
    /// failure.
    #[error("scheduling error for node {node_id}: {message}")]
    SchedulingTransient { node_id: NodeId, message: String },

    /// Non-zero exit or postcondition violation from a phase command.
    #[error("phase {phase} failed for node {node_id}: {message}")]
    PhaseFailure {
        node_id: NodeId,
        phase: String,
        message: String,
    },

    /// Escalated to the conflict resolver; resolver failure is a
    /// plan-level failure.
    #[error("merge conflict merging branch {branch} into {target}: {details}")]
    MergeConflict {
        branch: String,
        target: String,
        details: String,
    },

    /// Discovered on re-init; cannot distinguish from clean exit.
    #[error("node {node_id} crashed (no live process found on restart)")]
    Crashed { node_id: NodeId },

    /// Originates from user action.
    #[error("operation canceled for plan {plan_id}")]
    Cancelled { plan_id: PlanId },

    /// Persistence/registry write failures. Logged, throttled, never
    /// crash the core.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error(transparent)]
    Worktree(#[from] crate::worktree::WorktreeError),

    #[error(transparent)]
    Store(#[from] runner_store::StoreError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
