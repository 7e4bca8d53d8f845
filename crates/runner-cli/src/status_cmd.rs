//! `planrunner status` / `list` / `node`: read-only plan and node inspection.

use anyhow::{Context, Result};

use runner_core::facade::PlanRunner;
use runner_core::model::{NodeStatus, PlanInstance, ProducerId};

/// When `plan_id` is `Some`, show detailed status for that plan. When
/// `None`, list every plan with a progress summary.
pub async fn run_status(runner: &PlanRunner, plan_id: Option<&str>) -> Result<()> {
    match plan_id {
        Some(id) => run_plan_status(runner, id).await,
        None => run_fleet_status(runner).await,
    }
}

async fn run_plan_status(runner: &PlanRunner, plan_id_str: &str) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let plan = runner.get(plan_id).await?;

    println!("Plan: {} ({})", plan.spec.name, plan.id);
    println!("Status: {:?}", plan.status);
    println!("Base branch: {}  Target branch: {}", plan.base_branch, plan.target_branch);
    println!();

    let counts = node_counts(&plan);
    println!(
        "Nodes: {}/{} succeeded  pending={} ready={} scheduled={} running={} failed={} blocked={} canceled={}",
        counts.succeeded,
        plan.node_states.len(),
        counts.pending,
        counts.ready,
        counts.scheduled,
        counts.running,
        counts.failed,
        counts.blocked,
        counts.canceled,
    );
    println!();

    println!("Nodes:");
    for record in plan.nodes.values() {
        let state = plan.node_states.get(&record.node_id);
        let status = state.map(|s| s.status).unwrap_or(NodeStatus::Pending);
        let icon = status_icon(status);
        let attempts = state.map(|s| s.attempts.len()).unwrap_or(0);
        println!(
            "  [{icon}] {:<24} {:?} (attempts={attempts})",
            record.spec.producer_id, status
        );
    }

    Ok(())
}

async fn run_fleet_status(runner: &PlanRunner) -> Result<()> {
    let plans = runner.list().await;

    if plans.is_empty() {
        println!("No plans found.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<10} {:>10}", "ID", "NAME", "STATUS", "PROGRESS");
    println!("{}", "-".repeat(86));

    for plan in &plans {
        let counts = node_counts(plan);
        let total = plan.node_states.len();
        let progress = format!("{}/{total}", counts.succeeded);
        let name_display = if plan.spec.name.len() > 22 {
            format!("{}...", &plan.spec.name[..19])
        } else {
            plan.spec.name.clone()
        };
        println!("{:<38} {:<24} {:<10?} {:>10}", plan.id, name_display, plan.status, progress);
    }

    Ok(())
}

pub async fn run_node(runner: &PlanRunner, plan_id_str: &str, producer_id_str: &str) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let producer_id = ProducerId::parse(producer_id_str).with_context(|| format!("invalid producerId: {producer_id_str}"))?;
    let node = runner.get_node(plan_id, &producer_id).await?;

    println!("Node: {} ({})", node.producer_id, node.node_id);
    println!("Status: {:?}", node.state.status);
    if let Some(phase) = &node.state.current_phase {
        println!("Current phase: {phase}");
    }
    if let Some(commit) = &node.state.base_commit {
        println!("Base commit: {commit}");
    }
    if let Some(worktree) = &node.state.worktree_path {
        println!("Worktree: {worktree}");
    }
    println!("Attempts: {}", node.state.attempts.len());
    for attempt in &node.state.attempts {
        println!(
            "  attempt {}: precheck={:?} work={:?} postcheck={:?} commit={:?} mergeRI={:?}",
            attempt.attempt_id,
            attempt.phase_statuses.precheck,
            attempt.phase_statuses.work,
            attempt.phase_statuses.postcheck,
            attempt.phase_statuses.commit,
            attempt.phase_statuses.merge_ri,
        );
    }
    if let Some(error) = &node.state.error {
        println!("Error: {error}");
    }

    Ok(())
}

struct NodeCounts {
    pending: usize,
    ready: usize,
    scheduled: usize,
    running: usize,
    succeeded: usize,
    failed: usize,
    blocked: usize,
    canceled: usize,
}

fn node_counts(plan: &PlanInstance) -> NodeCounts {
    let mut counts = NodeCounts {
        pending: 0,
        ready: 0,
        scheduled: 0,
        running: 0,
        succeeded: 0,
        failed: 0,
        blocked: 0,
        canceled: 0,
    };
    for state in plan.node_states.values() {
        match state.status {
            NodeStatus::Pending => counts.pending += 1,
            NodeStatus::Ready => counts.ready += 1,
            NodeStatus::Scheduled => counts.scheduled += 1,
            NodeStatus::Running => counts.running += 1,
            NodeStatus::Succeeded => counts.succeeded += 1,
            NodeStatus::Failed => counts.failed += 1,
            NodeStatus::Blocked => counts.blocked += 1,
            NodeStatus::Canceled => counts.canceled += 1,
        }
    }
    counts
}

fn status_icon(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => ".",
        NodeStatus::Ready => ">",
        NodeStatus::Scheduled => ">",
        NodeStatus::Running => "*",
        NodeStatus::Succeeded => "+",
        NodeStatus::Failed => "!",
        NodeStatus::Blocked => "x",
        NodeStatus::Canceled => "-",
    }
}
