//! `planrunner enqueue` / pause / resume / cancel / delete.

use std::path::Path;

use anyhow::{Context, Result};

use runner_core::facade::PlanRunner;
use runner_core::model::PlanSpec;

/// Read a plan from disk. JSON is the wire format (§6.1); `.toml` files are
/// accepted as an operator convenience and parsed into the same `PlanSpec`.
fn read_plan_spec(path: &Path) -> Result<PlanSpec> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&raw).with_context(|| format!("parsing {} as TOML", path.display()))
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {} as JSON", path.display()))
    }
}

pub async fn run_enqueue(runner: &PlanRunner, file: &Path) -> Result<()> {
    let spec = read_plan_spec(file)?;
    let plan_id = runner.enqueue(spec).await.context("enqueuing plan")?;
    println!("Plan enqueued: {plan_id}");
    Ok(())
}

pub async fn run_pause(runner: &PlanRunner, plan_id: &str) -> Result<()> {
    let id = plan_id.parse().with_context(|| format!("invalid plan ID: {plan_id}"))?;
    runner.pause(id).await?;
    println!("Plan {plan_id} paused.");
    Ok(())
}

pub async fn run_resume(runner: &PlanRunner, plan_id: &str) -> Result<()> {
    let id = plan_id.parse().with_context(|| format!("invalid plan ID: {plan_id}"))?;
    runner.resume(id).await?;
    println!("Plan {plan_id} resumed.");
    Ok(())
}

pub async fn run_cancel(runner: &PlanRunner, plan_id: &str) -> Result<()> {
    let id = plan_id.parse().with_context(|| format!("invalid plan ID: {plan_id}"))?;
    runner.cancel(id).await?;
    println!("Plan {plan_id} canceled.");
    Ok(())
}

pub async fn run_delete(runner: &PlanRunner, plan_id: &str) -> Result<()> {
    let id = plan_id.parse().with_context(|| format!("invalid plan ID: {plan_id}"))?;
    runner.delete(id).await?;
    println!("Plan {plan_id} deleted.");
    Ok(())
}
