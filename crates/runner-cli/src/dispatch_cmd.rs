//! `planrunner retry-node` / `force-fail` / `reshape`: operator intervention
//! on a live plan (§6.1).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use runner_core::facade::PlanRunner;
use runner_core::model::{NodeSpec, ProducerId};
use runner_core::scheduler::{ReshapeOp, RetryNodeOptions};

pub async fn run_retry_node(runner: &PlanRunner, plan_id_str: &str, producer_id_str: &str, clear_worktree: bool) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let producer_id = ProducerId::parse(producer_id_str).with_context(|| format!("invalid producerId: {producer_id_str}"))?;
    let options = RetryNodeOptions {
        new_work: None,
        new_prechecks: None,
        new_postchecks: None,
        clear_worktree,
    };
    runner.retry_node(plan_id, &producer_id, options).await?;
    println!("Node {producer_id_str} reset to pending for retry.");
    Ok(())
}

pub async fn run_force_fail(runner: &PlanRunner, plan_id_str: &str, producer_id_str: &str) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let producer_id = ProducerId::parse(producer_id_str).with_context(|| format!("invalid producerId: {producer_id_str}"))?;
    runner.force_fail_node(plan_id, &producer_id).await?;
    println!("Node {producer_id_str} forced to failed.");
    Ok(())
}

/// On-disk shape for a `reshape` batch file: a JSON array of tagged ops
/// mirroring [`ReshapeOp`], since that enum has no `Deserialize` impl of
/// its own (it is constructed internally from validated `NodeSpec`s).
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ReshapeOpFile {
    AddNode { node: NodeSpec },
    RemoveNode { producer_id: ProducerId },
    UpdateDeps {
        producer_id: ProducerId,
        dependencies: std::collections::BTreeSet<ProducerId>,
    },
    AddBefore { target: ProducerId, node: NodeSpec },
    AddAfter { target: ProducerId, node: NodeSpec },
}

impl From<ReshapeOpFile> for ReshapeOp {
    fn from(op: ReshapeOpFile) -> Self {
        match op {
            ReshapeOpFile::AddNode { node } => ReshapeOp::AddNode(node),
            ReshapeOpFile::RemoveNode { producer_id } => ReshapeOp::RemoveNode(producer_id),
            ReshapeOpFile::UpdateDeps { producer_id, dependencies } => ReshapeOp::UpdateDeps { producer_id, dependencies },
            ReshapeOpFile::AddBefore { target, node } => ReshapeOp::AddBefore { target, node },
            ReshapeOpFile::AddAfter { target, node } => ReshapeOp::AddAfter { target, node },
        }
    }
}

pub async fn run_reshape(runner: &PlanRunner, plan_id_str: &str, file: &Path) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let file_ops: Vec<ReshapeOpFile> = serde_json::from_str(&raw).with_context(|| format!("parsing {} as a reshape batch", file.display()))?;
    let ops: Vec<ReshapeOp> = file_ops.into_iter().map(Into::into).collect();
    let count = ops.len();
    runner.reshape(plan_id, ops).await?;
    println!("Applied {count} reshape operation(s) to plan {plan_id_str}.");
    Ok(())
}
