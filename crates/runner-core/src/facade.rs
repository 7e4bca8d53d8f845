//! `PlanRunner` (component K): the composition root and public facade.
//!
//! Wires together the store, capacity registry, worktree manager, merge
//! manager, scheduler and webhook dispatcher from a [`RunnerConfig`], then
//! exposes the operator-facing surface from §6.1 as thin, mostly
//! delegating methods. Grounded on `cli::main`'s startup composition
//! (pool, config, harness registry) before handing control to the
//! orchestrator loop.

use std::path::PathBuf;
use std::sync::Arc;

use runner_store::{CapacityRegistry, PlanStore};

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::merge::{ConflictPreference, MergeManager};
use crate::model::{NodeId, NodeState, NodeStatus, PlanId, PlanInstance, PlanSpec, ProducerId};
use crate::procmon::ProcessMonitor;
use crate::scheduler::{self, ReshapeOp, RetryNodeOptions, Scheduler};
use crate::worktree::WorktreeManager;

/// Read-only snapshot of one node, returned by [`PlanRunner::get_node`].
#[derive(Debug, Clone)]
pub struct NodeView {
    pub producer_id: ProducerId,
    pub node_id: NodeId,
    pub state: NodeState,
}

/// Assembled failure context for a `failed`/`blocked` node (§7
/// "User-visible behavior"): what broke, and where to find the evidence.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub status: NodeStatus,
    pub error: Option<String>,
    pub failure_reason: Option<String>,
    pub log_path: Option<PathBuf>,
    pub last_attempt: Option<u32>,
}

/// The Plan Runner: construct once per repository via [`PlanRunner::bootstrap`]
/// and share the resulting `Arc` across every caller (CLI commands, HTTP
/// handlers, background loops).
pub struct PlanRunner {
    config: RunnerConfig,
    store: Arc<PlanStore>,
    registry: Arc<CapacityRegistry>,
    scheduler: Arc<Scheduler>,
}

impl PlanRunner {
    /// Compose the runner from a resolved config: build the store, register
    /// with the global capacity registry, rehydrate any plans persisted by
    /// a previous run (§4.5 "Read protocol"), and return a ready-to-use
    /// handle. Callers are expected to also spawn [`PlanRunner::run_background_loops`].
    pub async fn bootstrap(config: RunnerConfig) -> Result<Arc<Self>> {
        let instance_id = runner_store::registry::derive_instance_id(&config.repo_path);
        let store = Arc::new(PlanStore::new(config.repo_path.clone(), instance_id.clone()));
        let registry = Arc::new(CapacityRegistry::new(
            config.global_storage_dir.clone(),
            instance_id,
            config.default_max_parallel,
        ));
        registry.register().await?;

        let worktrees = Arc::new(WorktreeManager::new(config.repo_path.clone(), config.worktree_root.clone())?);
        let merge_checkouts_root = config.repo_path.join(".orchestrator").join("merge-checkouts");
        let merge = Arc::new(MergeManager::new(
            Arc::clone(&worktrees),
            merge_checkouts_root,
            None,
            ConflictPreference::Ours,
        ));

        let procmon = Arc::new(ProcessMonitor::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            worktrees,
            merge,
            Arc::clone(&procmon),
            config.command_timeout,
        ));

        let existing: Vec<(String, PlanInstance)> = store.load_all().await?;
        for (_id, plan) in existing {
            let paused = plan.paused;
            let plan_id = plan.id;
            scheduler.adopt(plan).await;
            // §4.5 "Crash recovery": any node this instance last saw as
            // `running` may belong to a process that died with the old
            // instance. Audit before the first pump, not after, so a
            // crashed node is never mistaken for still in flight.
            scheduler.recover_crashed(plan_id).await;
            if !paused {
                scheduler.pump(plan_id).await;
            }
        }

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            scheduler,
        }))
    }

    /// Spawn the periodic pump tick and the capacity-registry heartbeat.
    /// Callers own the returned handles; dropping them stops the loops.
    pub fn run_background_loops(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let pump = tokio::spawn(scheduler::periodic_pump_loop(
            Arc::clone(&self.scheduler),
            self.config.pump_interval,
        ));

        let heartbeat_self = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_self.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                heartbeat_self.send_heartbeat().await;
            }
        });

        (pump, heartbeat)
    }

    async fn send_heartbeat(&self) {
        let plans = self.scheduler.list().await;
        let mut running_jobs = 0u32;
        let mut active_plans = Vec::new();
        for handle in plans {
            let plan = handle.lock().await;
            let running = plan
                .node_states
                .values()
                .filter(|s| matches!(s.status, NodeStatus::Running | NodeStatus::Scheduled))
                .count() as u32;
            if running > 0 {
                active_plans.push(plan.id.to_string());
            }
            running_jobs += running;
        }
        if let Err(e) = self.registry.heartbeat(running_jobs, active_plans).await {
            tracing::warn!(error = %e, "capacity registry heartbeat failed");
        }
    }

    /// `enqueue(plan)` (§6.1).
    pub async fn enqueue(&self, spec: PlanSpec) -> Result<PlanId> {
        self.scheduler.enqueue(spec, self.config.repo_path.display().to_string()).await
    }

    /// `get(planId)`: a read-only snapshot of the plan's runtime state.
    pub async fn get(&self, plan_id: PlanId) -> Result<PlanInstance> {
        let handle = self.scheduler.get(plan_id).await.ok_or(RunnerError::PlanNotFound(plan_id))?;
        Ok(handle.lock().await.clone())
    }

    /// `list()`: every plan currently known to this instance.
    pub async fn list(&self) -> Vec<PlanInstance> {
        let mut out = Vec::new();
        for handle in self.scheduler.list().await {
            out.push(handle.lock().await.clone());
        }
        out
    }

    /// `getStatus(planId)`: just the plan's top-level status, without
    /// cloning the whole node map.
    pub async fn get_status(&self, plan_id: PlanId) -> Result<crate::model::PlanStatus> {
        let handle = self.scheduler.get(plan_id).await.ok_or(RunnerError::PlanNotFound(plan_id))?;
        Ok(handle.lock().await.status)
    }

    /// `getNode(planId, nodeId)` (accepts either the producer id or the
    /// system-assigned node id).
    pub async fn get_node(&self, plan_id: PlanId, producer_id: &ProducerId) -> Result<NodeView> {
        let handle = self.scheduler.get(plan_id).await.ok_or(RunnerError::PlanNotFound(plan_id))?;
        let plan = handle.lock().await;
        let node_id = plan.node_id_for(producer_id).ok_or_else(|| RunnerError::Validation {
            path: format!("nodes.{producer_id}"),
            message: "unknown producerId".to_string(),
        })?;
        let state = plan.node_states.get(&node_id).cloned().ok_or(RunnerError::NodeNotFound(node_id))?;
        Ok(NodeView {
            producer_id: producer_id.clone(),
            node_id,
            state,
        })
    }

    /// `getNodeLogs(planId, nodeId, attempt?)` (§6.2): the raw contents of
    /// one attempt's log file, defaulting to the most recent attempt.
    pub async fn get_node_logs(
        &self,
        plan_id: PlanId,
        producer_id: &ProducerId,
        attempt: Option<u32>,
    ) -> Result<String> {
        let node = self.get_node(plan_id, producer_id).await?;
        let attempt_id = attempt
            .or_else(|| node.state.current_attempt().map(|a| a.attempt_id))
            .ok_or_else(|| RunnerError::Validation {
                path: "attempt".to_string(),
                message: "node has not started any attempts yet".to_string(),
            })?;

        let log_path = self.log_path_for(plan_id, node.node_id, attempt_id);
        tokio::fs::read_to_string(&log_path)
            .await
            .map_err(|e| RunnerError::Infrastructure(format!("reading {}: {e}", log_path.display())))
    }

    fn log_path_for(&self, plan_id: PlanId, node_id: NodeId, attempt_id: u32) -> PathBuf {
        self.config
            .repo_path
            .join(".orchestrator")
            .join("logs")
            .join(plan_id.to_string())
            .join(node_id.to_string())
            .join(format!("attempt-{attempt_id}.log"))
    }

    /// `getFailureContext(planId, nodeId)` (§7): assembles the error,
    /// failure reason, and log path an operator needs to diagnose a
    /// `failed`/`blocked` node, without requiring them to know the on-disk
    /// log layout.
    pub async fn get_failure_context(&self, plan_id: PlanId, producer_id: &ProducerId) -> Result<FailureContext> {
        let node = self.get_node(plan_id, producer_id).await?;
        let last_attempt = node.state.current_attempt().map(|a| a.attempt_id);
        let log_path = last_attempt.map(|attempt_id| self.log_path_for(plan_id, node.node_id, attempt_id));
        Ok(FailureContext {
            status: node.state.status,
            error: node.state.error,
            failure_reason: node.state.failure_reason,
            log_path,
            last_attempt,
        })
    }

    pub async fn pause(&self, plan_id: PlanId) -> Result<()> {
        self.scheduler.pause(plan_id).await
    }

    pub async fn resume(&self, plan_id: PlanId) -> Result<()> {
        self.scheduler.resume(plan_id).await
    }

    pub async fn cancel(&self, plan_id: PlanId) -> Result<()> {
        self.scheduler.cancel(plan_id).await
    }

    /// `delete(planId)` (§6.1): only terminal plans should be deleted;
    /// callers are expected to `cancel` first if the plan is still live.
    pub async fn delete(&self, plan_id: PlanId) -> Result<()> {
        self.scheduler.delete(plan_id).await
    }

    pub async fn retry_node(&self, plan_id: PlanId, producer_id: &ProducerId, options: RetryNodeOptions) -> Result<()> {
        self.scheduler.retry_node(plan_id, producer_id, options).await
    }

    pub async fn force_fail_node(&self, plan_id: PlanId, producer_id: &ProducerId) -> Result<()> {
        self.scheduler.force_fail_node(plan_id, producer_id).await
    }

    pub async fn reshape(&self, plan_id: PlanId, ops: Vec<ReshapeOp>) -> Result<()> {
        self.scheduler.reshape(plan_id, ops).await
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with_config() -> (tempfile::TempDir, RunnerConfig) {
        let tmp = tempfile::TempDir::new().unwrap();
        std::process::Command::new("git").arg("init").current_dir(tmp.path()).output().unwrap();
        std::process::Command::new("git")
            .args(["commit", "--allow-empty", "-m", "root"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        let mut config = RunnerConfig::resolve(tmp.path());
        config.global_storage_dir = tmp.path().join("global");
        (tmp, config)
    }

    #[tokio::test]
    async fn bootstrap_with_empty_repo_has_no_plans() {
        let (_tmp, config) = repo_with_config();
        let runner = PlanRunner::bootstrap(config).await.unwrap();
        assert!(runner.list().await.is_empty());
    }

    #[tokio::test]
    async fn get_unknown_plan_returns_not_found() {
        let (_tmp, config) = repo_with_config();
        let runner = PlanRunner::bootstrap(config).await.unwrap();
        let err = runner.get(PlanId::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn enqueued_node_starts_pending_and_is_visible_via_get_node() {
        let (_tmp, config) = repo_with_config();
        let runner = PlanRunner::bootstrap(config).await.unwrap();
        let spec: PlanSpec = serde_json::from_value(serde_json::json!({
            "name": "demo",
            "baseBranch": "main",
            "startPaused": true,
            "nodes": [{
                "producerId": "build-app",
                "name": "build",
                "task": "build the app",
                "work": {"kind": "process", "executable": "true", "args": []}
            }]
        }))
        .unwrap();
        let plan_id = runner.enqueue(spec).await.unwrap();
        let producer_id = ProducerId::parse("build-app").unwrap();
        let node = runner.get_node(plan_id, &producer_id).await.unwrap();
        assert_eq!(node.state.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn get_node_logs_without_any_attempt_is_a_validation_error() {
        let (_tmp, config) = repo_with_config();
        let runner = PlanRunner::bootstrap(config).await.unwrap();
        let spec: PlanSpec = serde_json::from_value(serde_json::json!({
            "name": "demo",
            "baseBranch": "main",
            "startPaused": true,
            "nodes": [{
                "producerId": "build-app",
                "name": "build",
                "task": "build the app",
                "work": {"kind": "process", "executable": "true", "args": []}
            }]
        }))
        .unwrap();
        let plan_id = runner.enqueue(spec).await.unwrap();
        let producer_id = ProducerId::parse("build-app").unwrap();
        let err = runner.get_node_logs(plan_id, &producer_id, None).await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation { .. }));
    }
}
