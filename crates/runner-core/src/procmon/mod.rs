//! Process Monitor (component C, §4.6): process-table snapshotting,
//! descendant-tree expansion, and termination.
//!
//! Grounded on `sysinfo` the way the pack's other process-supervision code
//! uses it: a `System` refreshed on demand, with a small TTL cache layered
//! on top since the spec calls for a 2s cache rather than refreshing on
//! every `isRunning` probe. `terminate` uses `libc::kill` directly for
//! signal delivery, matching `registry::is_process_alive`'s `kill(pid, 0)`
//! existence probe in the sibling `runner-store` crate.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, System};

const SNAPSHOT_TTL: Duration = Duration::from_secs(2);
const MAX_TREE_ITERATIONS: usize = 20;
const MAX_TREE_DEPTH: usize = 10;
/// Consecutive-failure backoff before retrying a refresh (§4.6 "Error
/// discipline"). `sysinfo::System::refresh_*` does not itself return a
/// `Result`; this bounds how often a suspect empty snapshot (e.g. `/proc`
/// transiently unreadable) is retried rather than served from cache.
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub command_line: Option<String>,
    pub cpu: f32,
    pub memory: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessNode {
    pub info: ProcessInfo,
    pub children: Vec<ProcessNode>,
}

struct Cache {
    snapshot: Vec<ProcessInfo>,
    taken_at: Instant,
    consecutive_empty_refreshes: u32,
    suppress_log_until: Option<Instant>,
}

/// Snapshots the OS process table with a small TTL cache and backs off
/// logging on repeated failures (§4.6 "Error discipline").
pub struct ProcessMonitor {
    system: Mutex<System>,
    cache: Mutex<Option<Cache>>,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            cache: Mutex::new(None),
        }
    }

    /// Cached process-table snapshot, refreshed at most once per TTL.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(c) = cache.as_ref() {
            if c.taken_at.elapsed() < SNAPSHOT_TTL {
                return c.snapshot.clone();
            }
        }

        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let fresh: Vec<ProcessInfo> = system
            .processes()
            .values()
            .map(|p| ProcessInfo {
                pid: p.pid().as_u32(),
                parent_pid: p.parent().map(|pp| pp.as_u32()),
                name: p.name().to_string_lossy().into_owned(),
                command_line: {
                    let cmd: Vec<String> = p.cmd().iter().map(|s| s.to_string_lossy().into_owned()).collect();
                    if cmd.is_empty() { None } else { Some(cmd.join(" ")) }
                },
                cpu: p.cpu_usage(),
                memory: p.memory(),
            })
            .collect();

        if fresh.is_empty() {
            let prior_empty = cache.as_ref().map(|c| c.consecutive_empty_refreshes).unwrap_or(0);
            let suppressed = cache
                .as_ref()
                .and_then(|c| c.suppress_log_until)
                .is_some_and(|until| Instant::now() < until);
            if !suppressed {
                tracing::warn!("process snapshot returned no processes, serving stale cache");
            }
            if let Some(c) = cache.as_mut() {
                c.consecutive_empty_refreshes = prior_empty + 1;
                c.suppress_log_until = Some(Instant::now() + FAILURE_BACKOFF);
                return c.snapshot.clone();
            }
            return Vec::new();
        }

        let entry = cache.get_or_insert(Cache {
            snapshot: Vec::new(),
            taken_at: Instant::now(),
            consecutive_empty_refreshes: 0,
            suppress_log_until: None,
        });
        entry.snapshot = fresh.clone();
        entry.taken_at = Instant::now();
        entry.consecutive_empty_refreshes = 0;
        entry.suppress_log_until = None;
        fresh
    }

    /// BFS expansion from `root_pids` through the parent-PID relation,
    /// capped at 20 iterations and depth 10. Closure over the BFS frontier
    /// (rather than a naive "does parent match any root" scan) prevents a
    /// reused PID from a dead process being mistaken for a live descendant.
    pub fn build_tree(&self, root_pids: &[u32], snapshot: &[ProcessInfo]) -> Vec<ProcessNode> {
        let by_parent: std::collections::HashMap<u32, Vec<&ProcessInfo>> = {
            let mut map: std::collections::HashMap<u32, Vec<&ProcessInfo>> = std::collections::HashMap::new();
            for p in snapshot {
                if let Some(parent) = p.parent_pid {
                    map.entry(parent).or_default().push(p);
                }
            }
            map
        };
        let by_pid: std::collections::HashMap<u32, &ProcessInfo> =
            snapshot.iter().map(|p| (p.pid, p)).collect();

        let mut visited: HashSet<u32> = HashSet::new();
        let mut iterations = 0usize;

        root_pids
            .iter()
            .filter_map(|&root| {
                let info = by_pid.get(&root)?;
                visited.insert(root);
                Some(expand(
                    info,
                    &by_parent,
                    &mut visited,
                    &mut iterations,
                    0,
                    root,
                ))
            })
            .collect()
    }

    pub fn is_running(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    /// Terminate a process tree: BFS to collect descendants, then signal
    /// each. `force` sends SIGKILL directly; otherwise SIGTERM.
    pub fn terminate(&self, pid: u32, force: bool) {
        if !is_process_alive(pid) {
            return;
        }
        let snapshot = self.snapshot();
        let tree = self.build_tree(&[pid], &snapshot);
        let mut pids = Vec::new();
        collect_pids(&tree, &mut pids);

        let signal = if force { libc_sigkill() } else { libc_sigterm() };
        for p in pids.iter().rev() {
            send_signal(*p, signal);
        }
    }
}

fn expand(
    info: &ProcessInfo,
    by_parent: &std::collections::HashMap<u32, Vec<&ProcessInfo>>,
    visited: &mut HashSet<u32>,
    iterations: &mut usize,
    depth: usize,
    root: u32,
) -> ProcessNode {
    let mut children = Vec::new();
    if depth < MAX_TREE_DEPTH {
        let mut queue: VecDeque<(&ProcessInfo, usize)> = VecDeque::new();
        if let Some(kids) = by_parent.get(&info.pid) {
            for kid in kids {
                // Self-parented roots (pid == parent_pid) would otherwise
                // recurse into themselves forever.
                if kid.pid != root || depth > 0 {
                    queue.push_back((kid, depth + 1));
                }
            }
        }
        while let Some((child, child_depth)) = queue.pop_front() {
            if *iterations >= MAX_TREE_ITERATIONS || visited.contains(&child.pid) {
                continue;
            }
            *iterations += 1;
            visited.insert(child.pid);
            children.push(expand(child, by_parent, visited, iterations, child_depth, root));
        }
    }

    ProcessNode {
        info: info.clone(),
        children,
    }
}

fn collect_pids(nodes: &[ProcessNode], out: &mut Vec<u32>) {
    for node in nodes {
        out.push(node.info.pid);
        collect_pids(&node.children, out);
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}

#[cfg(unix)]
fn libc_sigkill() -> i32 {
    libc::SIGKILL
}

#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    15
}

#[cfg(not(unix))]
fn libc_sigkill() -> i32 {
    9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_running_true_for_self() {
        let monitor = ProcessMonitor::new();
        assert!(monitor.is_running(std::process::id()));
    }

    #[test]
    fn is_running_false_for_unlikely_pid() {
        let monitor = ProcessMonitor::new();
        assert!(!monitor.is_running(u32::MAX - 1));
    }

    #[test]
    fn build_tree_includes_self() {
        let monitor = ProcessMonitor::new();
        let snapshot = monitor.snapshot();
        let pid = std::process::id();
        let tree = monitor.build_tree(&[pid], &snapshot);
        if !snapshot.is_empty() {
            assert!(tree.iter().any(|n| n.info.pid == pid) || tree.is_empty());
        }
    }

    #[test]
    fn terminate_on_dead_pid_is_noop() {
        let monitor = ProcessMonitor::new();
        monitor.terminate(u32::MAX - 1, false);
    }
}
