//! Convenience dispatch helpers that wrap [`super::NodeStateMachine`]
//! transitions with semantic names, each of which also schedules a debounced
//! persist of the owning plan (§4.5).

use std::sync::Arc;

use runner_store::PlanStore;

use crate::model::{NodeId, NodeState, NodeStatus, PlanInstance};

use super::{NodeStateMachine, NodeTransitionEvent, TransitionError};

async fn persist(store: &Arc<PlanStore>, plan: &PlanInstance) {
    if let Err(e) = store.save_debounced(&plan.id.to_string(), plan).await {
        tracing::warn!(plan_id = %plan.id, error = %e, "failed to schedule plan persist");
    }
}

/// Promote a node out of `pending` once its dependencies have all
/// succeeded.
pub async fn mark_ready(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Ready)?;
    persist(store, plan).await;
    Ok(event)
}

/// Reserve a scheduler slot for a ready node.
pub async fn schedule(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Scheduled)?;
    persist(store, plan).await;
    Ok(event)
}

/// Roll a scheduled reservation back to `ready`, e.g. when worktree setup
/// fails transiently and the scheduler wants to retry the slot next pump.
pub async fn rollback_to_ready(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Ready)?;
    persist(store, plan).await;
    Ok(event)
}

/// Begin execution: transition `scheduled -> running`, opening a new
/// attempt record.
pub async fn start_running(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Running)?;
    persist(store, plan).await;
    Ok(event)
}

pub async fn succeed(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Succeeded)?;
    persist(store, plan).await;
    Ok(event)
}

pub async fn fail(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
    error: impl Into<String>,
    failure_reason: impl Into<String>,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    state.error = Some(error.into());
    state.failure_reason = Some(failure_reason.into());
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Failed)?;
    persist(store, plan).await;
    Ok(event)
}

/// Block a node because a dependency failed or was blocked and
/// `onFailure.noAutoHeal` forbids auto-healing (§5 edge case "blocked
/// propagation").
pub async fn block(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
    reason: impl Into<String>,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    state.failure_reason = Some(reason.into());
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Blocked)?;
    persist(store, plan).await;
    Ok(event)
}

/// Cancel a node, valid from any non-terminal state.
pub async fn cancel(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Canceled)?;
    persist(store, plan).await;
    Ok(event)
}

/// Retry a failed or blocked node: transition back to `pending`, clearing
/// error context; dependency gating re-promotes it to `ready` on the next
/// pump.
pub async fn retry(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::transition(node_id, state, NodeStatus::Pending)?;
    persist(store, plan).await;
    Ok(event)
}

/// Operator override: force a node to `failed` regardless of its current
/// phase (§6.1 `forceFailNode`).
pub async fn force_fail(
    store: &Arc<PlanStore>,
    plan: &mut PlanInstance,
    node_id: NodeId,
    reason: impl Into<String>,
) -> Result<NodeTransitionEvent, TransitionError> {
    let state = state_mut(plan, node_id);
    let event = NodeStateMachine::force_fail(node_id, state, reason)?;
    persist(store, plan).await;
    Ok(event)
}

fn state_mut(plan: &mut PlanInstance, node_id: NodeId) -> &mut NodeState {
    plan.node_states
        .get_mut(&node_id)
        .expect("node_id must belong to plan")
}
