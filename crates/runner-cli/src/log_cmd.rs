//! `planrunner logs` / `failure`: attempt log retrieval and failure diagnosis.

use anyhow::{Context, Result};

use runner_core::facade::PlanRunner;
use runner_core::model::ProducerId;

pub async fn run_logs(runner: &PlanRunner, plan_id_str: &str, producer_id_str: &str, attempt: Option<u32>) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let producer_id = ProducerId::parse(producer_id_str).with_context(|| format!("invalid producerId: {producer_id_str}"))?;
    let log = runner.get_node_logs(plan_id, &producer_id, attempt).await?;
    print!("{log}");
    Ok(())
}

pub async fn run_failure(runner: &PlanRunner, plan_id_str: &str, producer_id_str: &str) -> Result<()> {
    let plan_id = plan_id_str.parse().with_context(|| format!("invalid plan ID: {plan_id_str}"))?;
    let producer_id = ProducerId::parse(producer_id_str).with_context(|| format!("invalid producerId: {producer_id_str}"))?;
    let ctx = runner.get_failure_context(plan_id, &producer_id).await?;

    println!("Status: {:?}", ctx.status);
    if let Some(reason) = &ctx.failure_reason {
        println!("Failure reason: {reason}");
    }
    if let Some(error) = &ctx.error {
        println!("Error: {error}");
    }
    if let Some(attempt) = ctx.last_attempt {
        println!("Last attempt: {attempt}");
    }
    if let Some(path) = &ctx.log_path {
        println!("Log: {}", path.display());
    }

    Ok(())
}
