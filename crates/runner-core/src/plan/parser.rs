//! Plan validation (§6.1): "Validation rejects: unknown fields, cycles,
//! duplicate producerId, dangling dependency references, out-of-range
//! maxParallel (1..32), producerId pattern violations. Field size bounds
//! mirror the schema... Validation errors are reported as a single
//! structured error per request with the offending path."
//!
//! `#[serde(deny_unknown_fields)]` on [`PlanSpec`]/[`NodeSpec`] already
//! rejects unknown fields during deserialization; this module covers the
//! cross-field rules serde cannot express. Cycle detection reuses Kahn's
//! algorithm.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::model::{PlanSpec, MAX_INSTRUCTIONS_LEN, MAX_TASK_LEN};

const MIN_MAX_PARALLEL: u32 = 1;
const MAX_MAX_PARALLEL: u32 = 32;

pub type PlanValidationError = RunnerValidationError;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("validation error at {path}: {message}")]
pub struct RunnerValidationError {
    pub path: String,
    pub message: String,
}

impl RunnerValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<RunnerValidationError> for crate::error::RunnerError {
    fn from(e: RunnerValidationError) -> Self {
        crate::error::RunnerError::Validation {
            path: e.path,
            message: e.message,
        }
    }
}

/// Validate a [`PlanSpec`] against every rule in §6.1. Returns the first
/// violation found, in the order the rules are listed there.
pub fn validate_plan(plan: &PlanSpec) -> Result<(), RunnerValidationError> {
    if plan.nodes.is_empty() {
        return Err(RunnerValidationError::new("nodes", "plan must declare at least one node"));
    }

    if !(MIN_MAX_PARALLEL..=MAX_MAX_PARALLEL).contains(&plan.max_parallel) {
        return Err(RunnerValidationError::new(
            "maxParallel",
            format!(
                "maxParallel {} out of range [{MIN_MAX_PARALLEL}, {MAX_MAX_PARALLEL}]",
                plan.max_parallel
            ),
        ));
    }

    let mut seen = HashSet::new();
    for (i, node) in plan.nodes.iter().enumerate() {
        let path = format!("nodes[{i}]");

        if !seen.insert(node.producer_id.as_str()) {
            return Err(RunnerValidationError::new(
                format!("{path}.producerId"),
                format!("duplicate producerId {:?}", node.producer_id.as_str()),
            ));
        }

        if node.task.len() > MAX_TASK_LEN {
            return Err(RunnerValidationError::new(
                format!("{path}.task"),
                format!("task exceeds {MAX_TASK_LEN} characters"),
            ));
        }

        if node.instructions.as_ref().is_some_and(|s| s.len() > MAX_INSTRUCTIONS_LEN) {
            return Err(RunnerValidationError::new(
                format!("{path}.instructions"),
                format!("instructions exceed {MAX_INSTRUCTIONS_LEN} characters"),
            ));
        }
    }

    for (i, node) in plan.nodes.iter().enumerate() {
        let path = format!("nodes[{i}].dependencies");
        for dep in &node.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(RunnerValidationError::new(
                    path,
                    format!("node {:?} depends on unknown producerId {:?}", node.producer_id, dep),
                ));
            }
        }
    }

    for group in &plan.groups {
        for member in &group.members {
            if !seen.contains(member.as_str()) {
                return Err(RunnerValidationError::new(
                    format!("groups[{:?}].members", group.name),
                    format!("group {:?} references unknown producerId {:?}", group.name, member),
                ));
            }
        }
    }

    check_for_cycles(plan)
}

/// Kahn's algorithm over the `producerId` dependency edges.
fn check_for_cycles(plan: &PlanSpec) -> Result<(), RunnerValidationError> {
    let ids: Vec<&str> = plan.nodes.iter().map(|n| n.producer_id.as_str()).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for node in &plan.nodes {
        let node_idx = index[node.producer_id.as_str()];
        for dep in &node.dependencies {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                continue; // already reported by the dangling-reference check above
            };
            adj[dep_idx].push(node_idx);
            in_degree[node_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| ids[i])
            .collect();
        return Err(RunnerValidationError::new(
            "nodes",
            format!("dependency cycle detected involving: {}", cyclic.join(", ")),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeSpec, ProducerId, Shell, WorkSpec};
    use std::collections::BTreeSet;

    fn node(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            producer_id: ProducerId::parse(id).unwrap(),
            name: id.to_string(),
            task: "do thing".to_string(),
            instructions: None,
            dependencies: deps.iter().map(|d| ProducerId::parse(d).unwrap()).collect::<BTreeSet<_>>(),
            work: WorkSpec::Shell {
                command: "true".to_string(),
                shell: Shell::Bash,
            },
            prechecks: None,
            postchecks: None,
            expects_no_changes: false,
            on_failure: None,
        }
    }

    fn plan(nodes: Vec<NodeSpec>) -> PlanSpec {
        PlanSpec {
            name: "p".to_string(),
            base_branch: "main".to_string(),
            target_branch: None,
            max_parallel: 4,
            clean_up_successful_work: false,
            start_paused: false,
            nodes,
            groups: vec![],
        }
    }

    #[test]
    fn accepts_valid_dag() {
        let p = plan(vec![node("a", &[]), node("b", &["a"])]);
        validate_plan(&p).unwrap();
    }

    #[test]
    fn rejects_empty_node_list() {
        let p = plan(vec![]);
        assert_eq!(validate_plan(&p).unwrap_err().path, "nodes");
    }

    #[test]
    fn rejects_out_of_range_max_parallel() {
        let mut p = plan(vec![node("a", &[])]);
        p.max_parallel = 0;
        assert_eq!(validate_plan(&p).unwrap_err().path, "maxParallel");
        p.max_parallel = 33;
        assert_eq!(validate_plan(&p).unwrap_err().path, "maxParallel");
    }

    #[test]
    fn rejects_duplicate_producer_id() {
        let p = plan(vec![node("a", &[]), node("a", &[])]);
        let err = validate_plan(&p).unwrap_err();
        assert!(err.path.ends_with("producerId"));
    }

    #[test]
    fn rejects_dangling_dependency() {
        let p = plan(vec![node("a", &["missing"])]);
        let err = validate_plan(&p).unwrap_err();
        assert!(err.path.ends_with("dependencies"));
    }

    #[test]
    fn rejects_direct_cycle() {
        let p = plan(vec![node("a", &["b"]), node("b", &["a"])]);
        assert_eq!(validate_plan(&p).unwrap_err().path, "nodes");
    }

    #[test]
    fn rejects_transitive_cycle() {
        let p = plan(vec![node("a", &["c"]), node("b", &["a"]), node("c", &["b"])]);
        assert_eq!(validate_plan(&p).unwrap_err().path, "nodes");
    }

    #[test]
    fn accepts_diamond_dag() {
        let p = plan(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ]);
        validate_plan(&p).unwrap();
    }

    #[test]
    fn rejects_oversized_task() {
        let mut p = plan(vec![node("a", &[])]);
        p.nodes[0].task = "x".repeat(MAX_TASK_LEN + 1);
        let err = validate_plan(&p).unwrap_err();
        assert!(err.path.ends_with(".task"));
    }
}
