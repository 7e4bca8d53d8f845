//! The plan/node data model (§3).
//!
//! `PlanSpec` is the immutable declarative input; `PlanInstance` is the
//! mutable runtime aggregate built from it. Node identity is split between
//! a user-assigned [`ProducerId`] (stable across edits, used for dependency
//! references) and a system-assigned [`NodeId`] (a UUID, used as the map key
//! and the worktree branch seed).

mod ids;
mod node;
mod plan;
mod work;

pub use ids::{NodeId, PlanId, ProducerId, ProducerIdError};
pub use node::{AttemptRecord, NodeState, NodeStatus, PhaseStatus, PhaseStatuses, NO_CHANGES_SENTINEL};
pub use plan::{GroupSpec, NodeRecord, PlanInstance, PlanSpec, PlanStatus};
pub use work::{FailurePolicy, NodeSpec, Shell, WorkSpec, MAX_INSTRUCTIONS_LEN, MAX_TASK_LEN};
