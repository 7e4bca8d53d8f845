//! `PlanSpec` (immutable input) and `PlanInstance` (runtime aggregate), §3.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::{NodeId, PlanId, ProducerId};
use super::node::NodeState;
use super::work::NodeSpec;

/// Optional grouping of nodes for read-only status aggregation (§4.2
/// "derived group status").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub members: Vec<ProducerId>,
}

/// Immutable declarative input (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanSpec {
    pub name: String,
    pub base_branch: String,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default)]
    pub clean_up_successful_work: bool,
    #[serde(default)]
    pub start_paused: bool,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

fn default_max_parallel() -> u32 {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

/// Runtime aggregate for one enqueued plan (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInstance {
    pub id: PlanId,
    pub spec: PlanSpec,
    /// Maps the user-facing producer id to the system-assigned node id and
    /// the declarative spec, preserving declaration order for the
    /// scheduler's ordering guarantee (§4.1).
    pub nodes: BTreeMap<ProducerId, NodeRecord>,
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub repo_path: String,
    pub base_branch: String,
    pub target_branch: String,
    pub max_parallel: u32,
    // `mergedLeafIds` was the field name in the schema's first revision;
    // accepted here so plans saved by that version still load (§4.5
    // "Backwards-compatible field fallbacks").
    #[serde(default, alias = "mergedLeafIds")]
    pub merged_leaves: BTreeSet<NodeId>,
    #[serde(default)]
    pub completed_commits: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub base_commits: BTreeMap<NodeId, String>,
    pub status: PlanStatus,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub spec: NodeSpec,
    /// Position in `spec.nodes`, used to enforce declaration-order
    /// selection (§4.1 "Ordering guarantees").
    pub declaration_order: usize,
}

impl PlanInstance {
    pub fn node_id_for(&self, producer_id: &ProducerId) -> Option<NodeId> {
        self.nodes.get(producer_id).map(|r| r.node_id)
    }

    pub fn producer_id_for(&self, node_id: NodeId) -> Option<&ProducerId> {
        self.nodes
            .iter()
            .find(|(_, r)| r.node_id == node_id)
            .map(|(pid, _)| pid)
    }

    /// Leaves are nodes with no dependents within the plan.
    pub fn leaf_node_ids(&self) -> BTreeSet<NodeId> {
        let mut has_dependent: BTreeSet<&ProducerId> = BTreeSet::new();
        for record in self.nodes.values() {
            for dep in &record.spec.dependencies {
                has_dependent.insert(dep);
            }
        }
        self.nodes
            .iter()
            .filter(|(pid, _)| !has_dependent.contains(pid))
            .map(|(_, r)| r.node_id)
            .collect()
    }

    pub fn is_leaf(&self, node_id: NodeId) -> bool {
        self.leaf_node_ids().contains(&node_id)
    }

    /// Derived group status (§4.2): `succeeded` iff all members succeeded;
    /// `failed` if any member `failed`/`blocked`; `running` if any member
    /// `running`/`scheduled`; else `pending`.
    pub fn group_status(&self, group: &GroupSpec) -> super::node::NodeStatus {
        use super::node::NodeStatus::*;
        let member_states: Vec<&NodeState> = group
            .members
            .iter()
            .filter_map(|pid| self.node_id_for(pid))
            .filter_map(|id| self.node_states.get(&id))
            .collect();

        if member_states.iter().all(|s| s.status == Succeeded) {
            Succeeded
        } else if member_states.iter().any(|s| matches!(s.status, Failed | Blocked)) {
            Failed
        } else if member_states.iter().any(|s| matches!(s.status, Running | Scheduled)) {
            Running
        } else {
            Pending
        }
    }
}
