//! Per-node state machine (component I, §4.2).
//!
//! Transitions are atomic and monotonic in `version`: every call that
//! mutates a [`NodeState`] goes through [`NodeStateMachine::transition`],
//! which validates the edge, bumps `version`, stamps timestamps, and
//! returns the [`NodeTransitionEvent`] to persist and broadcast. A
//! Postgres-backed optimistic lock (a row-count check on an `UPDATE ...
//! WHERE status = $from`) has no database to run against here; the same
//! guarantee is reproduced structurally by requiring callers to hold the
//! plan-level lock (see `scheduler::PlanRuntime`) for the duration of the
//! mutation, rather than by a separate compare step.

pub mod dispatch;

use chrono::Utc;
use thiserror::Error;

use crate::model::{AttemptRecord, NodeId, NodeState, NodeStatus, PhaseStatuses};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition {from:?} -> {to:?} for node {node_id}")]
    InvalidEdge {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}

#[derive(Debug, Clone)]
pub struct NodeTransitionEvent {
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct NodeStateMachine;

impl NodeStateMachine {
    /// Whether `from -> to` is a legal edge in the graph described in
    /// §4.2. `failed -> pending` and `blocked -> pending` are the two retry
    /// edges: this machine resets all the way to `pending` and lets
    /// dependency gating re-promote to `ready`, rather than jumping
    /// straight back to a scheduled state.
    pub fn is_valid_transition(from: NodeStatus, to: NodeStatus) -> bool {
        use NodeStatus::*;
        if to == Canceled {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Pending, Ready)
                | (Ready, Scheduled)
                | (Scheduled, Running)
                | (Scheduled, Ready)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Blocked)
                | (Ready, Blocked)
                | (Scheduled, Blocked)
                | (Failed, Pending)
                | (Blocked, Pending)
        )
    }

    /// Execute a validated transition, bumping `version` and stamping
    /// timestamps. Returns the event to persist/broadcast.
    pub fn transition(
        node_id: NodeId,
        state: &mut NodeState,
        to: NodeStatus,
    ) -> Result<NodeTransitionEvent, TransitionError> {
        let from = state.status;
        if !Self::is_valid_transition(from, to) {
            return Err(TransitionError::InvalidEdge { node_id, from, to });
        }

        let now = Utc::now();

        if from == NodeStatus::Scheduled && to == NodeStatus::Running {
            state.started_at = Some(now);
            state.attempts.push(AttemptRecord {
                attempt_id: state.attempts.len() as u32 + 1,
                started_at: now,
                ended_at: None,
                phase_statuses: PhaseStatuses::default(),
                log_file: format!("attempt-{}.log", state.attempts.len() + 1),
                session_id: None,
            });
        }

        if matches!(
            to,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Canceled | NodeStatus::Blocked
        ) {
            state.ended_at = Some(now);
            if let Some(attempt) = state.current_attempt_mut() {
                if attempt.ended_at.is_none() {
                    attempt.ended_at = Some(now);
                }
            }
        }

        if matches!(from, NodeStatus::Failed | NodeStatus::Blocked) && to == NodeStatus::Pending {
            state.error = None;
            state.failure_reason = None;
            state.pid = None;
            state.ended_at = None;
        }

        state.status = to;
        state.version += 1;

        Ok(NodeTransitionEvent {
            node_id,
            from,
            to,
            timestamp: now,
        })
    }

    /// Operator override (`forceFailNode`, §6.1): force a node straight to
    /// `failed` from any non-terminal state, bypassing the normal edge
    /// table. Unlike [`Self::transition`], this is not a state-machine
    /// edge -- it is an escape hatch for an operator who has independently
    /// determined the node's work is bad, regardless of which phase it is
    /// currently in.
    pub fn force_fail(
        node_id: NodeId,
        state: &mut NodeState,
        reason: impl Into<String>,
    ) -> Result<NodeTransitionEvent, TransitionError> {
        let from = state.status;
        if from.is_terminal() {
            return Err(TransitionError::InvalidEdge {
                node_id,
                from,
                to: NodeStatus::Failed,
            });
        }

        let now = Utc::now();
        state.ended_at = Some(now);
        state.failure_reason = Some(reason.into());
        if let Some(attempt) = state.current_attempt_mut() {
            if attempt.ended_at.is_none() {
                attempt.ended_at = Some(now);
            }
        }
        state.status = NodeStatus::Failed;
        state.version += 1;

        Ok(NodeTransitionEvent {
            node_id,
            from,
            to: NodeStatus::Failed,
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(status: NodeStatus) -> NodeState {
        let mut s = NodeState::new_pending();
        s.status = status;
        s
    }

    #[test]
    fn valid_forward_path() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Pending);
        NodeStateMachine::transition(id, &mut s, NodeStatus::Ready).unwrap();
        NodeStateMachine::transition(id, &mut s, NodeStatus::Scheduled).unwrap();
        NodeStateMachine::transition(id, &mut s, NodeStatus::Running).unwrap();
        assert_eq!(s.attempts.len(), 1);
        NodeStateMachine::transition(id, &mut s, NodeStatus::Succeeded).unwrap();
        assert_eq!(s.status, NodeStatus::Succeeded);
        assert_eq!(s.version, 4);
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn rejects_invalid_edge() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Pending);
        let err = NodeStateMachine::transition(id, &mut s, NodeStatus::Running).unwrap_err();
        assert_eq!(
            err,
            TransitionError::InvalidEdge {
                node_id: id,
                from: NodeStatus::Pending,
                to: NodeStatus::Running
            }
        );
        assert_eq!(s.version, 0);
    }

    #[test]
    fn scheduled_can_roll_back_to_ready() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Scheduled);
        NodeStateMachine::transition(id, &mut s, NodeStatus::Ready).unwrap();
        assert_eq!(s.status, NodeStatus::Ready);
    }

    #[test]
    fn retry_resets_error_context() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Failed);
        s.error = Some("boom".into());
        s.failure_reason = Some("work".into());
        NodeStateMachine::transition(id, &mut s, NodeStatus::Pending).unwrap();
        assert!(s.error.is_none());
        assert!(s.failure_reason.is_none());
    }

    #[test]
    fn any_non_terminal_can_be_canceled() {
        for from in [NodeStatus::Pending, NodeStatus::Ready, NodeStatus::Scheduled, NodeStatus::Running] {
            let id = NodeId::new();
            let mut s = node(from);
            NodeStateMachine::transition(id, &mut s, NodeStatus::Canceled).unwrap();
            assert_eq!(s.status, NodeStatus::Canceled);
        }
    }

    #[test]
    fn terminal_states_cannot_be_canceled() {
        for from in [NodeStatus::Succeeded, NodeStatus::Failed, NodeStatus::Blocked, NodeStatus::Canceled] {
            let id = NodeId::new();
            let mut s = node(from);
            assert!(NodeStateMachine::transition(id, &mut s, NodeStatus::Canceled).is_err());
        }
    }

    #[test]
    fn blocked_node_can_be_retried_to_pending() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Blocked);
        s.failure_reason = Some("dependency failed".into());
        NodeStateMachine::transition(id, &mut s, NodeStatus::Pending).unwrap();
        assert_eq!(s.status, NodeStatus::Pending);
        assert!(s.failure_reason.is_none());
    }

    #[test]
    fn force_fail_overrides_any_non_terminal_state() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Running);
        NodeStateMachine::force_fail(id, &mut s, "operator override").unwrap();
        assert_eq!(s.status, NodeStatus::Failed);
        assert_eq!(s.failure_reason.as_deref(), Some("operator override"));
    }

    #[test]
    fn force_fail_rejects_already_terminal_node() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Succeeded);
        assert!(NodeStateMachine::force_fail(id, &mut s, "x").is_err());
    }

    #[test]
    fn version_is_monotone_across_many_transitions() {
        let id = NodeId::new();
        let mut s = node(NodeStatus::Pending);
        let path = [
            NodeStatus::Ready,
            NodeStatus::Scheduled,
            NodeStatus::Running,
            NodeStatus::Failed,
            NodeStatus::Pending,
            NodeStatus::Ready,
        ];
        let mut last_version = s.version;
        for to in path {
            NodeStateMachine::transition(id, &mut s, to).unwrap();
            assert!(s.version > last_version);
            last_version = s.version;
        }
    }
}
