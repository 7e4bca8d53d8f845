//! Command Executor and Node Executor (components A and H).
//!
//! The low-level command runner is grounded on
//! `invariant::runner::run_invariant`: spawn with piped stdio, read stdout
//! and stderr concurrently via `tokio::join!` so a full pipe buffer cannot
//! deadlock the wait, and race the whole thing against a `tokio::time`
//! timeout that kills the child on expiry. The phase sequence
//! (prechecks -> work -> postchecks -> commit) is grounded on
//! `lifecycle::run_agent_lifecycle`'s phase-by-phase driving of one task
//! through a harness, generalized here to dispatch on the `WorkSpec` tagged
//! union instead of a single `Harness` trait object.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

use crate::model::{NodeSpec, PhaseStatus, Shell, WorkSpec, NO_CHANGES_SENTINEL};

pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Which of the four executed phases an outcome belongs to (§7
/// `failureReason`). `mergeRI` is driven separately by the scheduler once a
/// node reaches `succeeded`, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Precheck,
    Work,
    Postcheck,
    Commit,
}

impl Phase {
    pub fn failure_reason(self) -> &'static str {
        match self {
            Phase::Precheck => "prechecks",
            Phase::Work => "work",
            Phase::Postcheck => "postchecks",
            Phase::Commit => "commit",
        }
    }
}

/// Progress reported out-of-band while a node executes, so the scheduler can
/// write the live PID and per-phase status onto the node's state without
/// `execute_node` itself needing a handle to the plan.
#[derive(Debug, Clone)]
pub enum NodeProgress {
    Pid(Option<u32>),
    Phase(Phase, PhaseStatus),
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run a command to completion, capturing stdio, bounded by `timeout`. On
/// timeout the child is killed and a synthetic failing outcome is returned,
/// never an error -- treating timeout as a result, not an exceptional
/// path.
pub async fn run_command(
    executable: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
    progress: Option<&UnboundedSender<NodeProgress>>,
) -> std::io::Result<CommandOutcome> {
    let start = Instant::now();

    let mut child = Command::new(executable)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(tx) = progress {
        let _ = tx.send(NodeProgress::Pid(child.id()));
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let result = match tokio::time::timeout(timeout, async { tokio::join!(child.wait(), read_stdout, read_stderr) }).await
    {
        Ok((Ok(status), stdout, stderr)) => Ok(CommandOutcome {
            exit_code: status.code(),
            stdout,
            stderr,
            duration_ms: i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX),
            timed_out: false,
        }),
        Ok((Err(e), _, _)) => Err(e),
        Err(_) => {
            let _ = child.kill().await;
            Ok(CommandOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("Command timed out after {}ms", timeout.as_millis()),
                duration_ms: i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX),
                timed_out: true,
            })
        }
    };

    if let Some(tx) = progress {
        let _ = tx.send(NodeProgress::Pid(None));
    }

    result
}

fn shell_invocation(shell: Shell) -> (&'static str, &'static str) {
    match shell {
        Shell::Cmd => ("cmd", "/C"),
        Shell::Powershell => ("powershell", "-Command"),
        Shell::Pwsh => ("pwsh", "-Command"),
        Shell::Bash => ("bash", "-c"),
        Shell::Sh => ("sh", "-c"),
    }
}

/// Spawn one [`WorkSpec`] variant and wait for it to finish, dispatching on
/// the tagged union rather than a single harness abstraction.
pub async fn run_work_spec(
    spec: &WorkSpec,
    cwd: &Path,
    timeout: Duration,
    progress: Option<&UnboundedSender<NodeProgress>>,
) -> std::io::Result<CommandOutcome> {
    match spec {
        WorkSpec::Process { executable, args } => run_command(executable, args, cwd, timeout, progress).await,
        WorkSpec::Shell { command, shell } => {
            let (program, flag) = shell_invocation(*shell);
            run_command(program, &[flag.to_string(), command.clone()], cwd, timeout, progress).await
        }
        WorkSpec::Agent {
            instructions,
            max_turns,
            allowed_folders,
            allowed_urls,
        } => {
            // The agent is invoked as an opaque child process; the runner
            // only observes stdio, exit code and PID, per §1 "out of
            // scope: the specific AI agent invoked as a child process".
            let mut args = vec!["--instructions".to_string(), instructions.clone()];
            if let Some(turns) = max_turns {
                args.push("--max-turns".to_string());
                args.push(turns.to_string());
            }
            for folder in allowed_folders {
                args.push("--allow-folder".to_string());
                args.push(folder.clone());
            }
            for url in allowed_urls {
                args.push("--allow-url".to_string());
                args.push(url.clone());
            }
            run_command("agent", &args, cwd, timeout, progress).await
        }
    }
}

pub struct NodeExecutionContext {
    pub node_name: String,
    pub worktree_path: PathBuf,
    pub expects_no_changes: bool,
    /// Path to this attempt's log file (§6.2
    /// `.orchestrator/logs/<planId>/<nodeId>/attempt-<n>.log`), appended to
    /// as each phase runs so `getNodeLogs` has something to read.
    pub log_path: PathBuf,
    /// PID and phase-status updates, drained by the scheduler into the
    /// node's live `NodeState` while this attempt is in flight.
    pub progress: UnboundedSender<NodeProgress>,
}

#[derive(Debug, Clone)]
pub enum NodeExecutionOutcome {
    Succeeded { commit: String },
    Failed { phase: Phase, message: String },
}

async fn append_log(log_path: &Path, phase: &str, body: &str) {
    if let Some(parent) = log_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let line = format!(
        "===== {phase} @ {} =====\n{body}\n",
        chrono::Utc::now().to_rfc3339()
    );
    match tokio::fs::OpenOptions::new().create(true).append(true).open(log_path).await {
        Ok(mut file) => {
            use tokio::io::AsyncWriteExt;
            let _ = file.write_all(line.as_bytes()).await;
        }
        Err(e) => tracing::warn!(path = %log_path.display(), error = %e, "failed to append node log"),
    }
}

fn phase_log_body(outcome: &CommandOutcome) -> String {
    format!(
        "exit_code={:?} timed_out={} duration_ms={}\n--- stdout ---\n{}\n--- stderr ---\n{}",
        outcome.exit_code, outcome.timed_out, outcome.duration_ms, outcome.stdout, outcome.stderr
    )
}

/// Drive one node through prechecks -> work -> postchecks -> commit
/// (§4.2's `phaseStatuses`; `mergeRI` is driven separately by the scheduler
/// via the Merge Manager once the node reaches `succeeded`).
pub async fn execute_node(
    node: &NodeSpec,
    ctx: &NodeExecutionContext,
    timeout: Duration,
) -> NodeExecutionOutcome {
    let progress = Some(&ctx.progress);
    let report = |phase: Phase, status: PhaseStatus| {
        let _ = ctx.progress.send(NodeProgress::Phase(phase, status));
    };

    if let Some(precheck) = &node.prechecks {
        report(Phase::Precheck, PhaseStatus::Running);
        match run_work_spec(precheck, &ctx.worktree_path, timeout, progress).await {
            Ok(outcome) if outcome.succeeded() => {
                append_log(&ctx.log_path, "precheck", &phase_log_body(&outcome)).await;
                report(Phase::Precheck, PhaseStatus::Passed);
            }
            Ok(outcome) => {
                append_log(&ctx.log_path, "precheck", &phase_log_body(&outcome)).await;
                report(Phase::Precheck, PhaseStatus::Failed);
                return NodeExecutionOutcome::Failed {
                    phase: Phase::Precheck,
                    message: format!("precheck failed: {}", outcome.stderr),
                };
            }
            Err(e) => {
                append_log(&ctx.log_path, "precheck", &format!("could not start: {e}")).await;
                report(Phase::Precheck, PhaseStatus::Failed);
                return NodeExecutionOutcome::Failed {
                    phase: Phase::Precheck,
                    message: format!("precheck could not start: {e}"),
                };
            }
        }
    } else {
        report(Phase::Precheck, PhaseStatus::Skipped);
    }

    report(Phase::Work, PhaseStatus::Running);
    match run_work_spec(&node.work, &ctx.worktree_path, timeout, progress).await {
        Ok(outcome) if outcome.succeeded() => {
            append_log(&ctx.log_path, "work", &phase_log_body(&outcome)).await;
            report(Phase::Work, PhaseStatus::Passed);
        }
        Ok(outcome) => {
            append_log(&ctx.log_path, "work", &phase_log_body(&outcome)).await;
            report(Phase::Work, PhaseStatus::Failed);
            return NodeExecutionOutcome::Failed {
                phase: Phase::Work,
                message: format!("work failed: {}", outcome.stderr),
            };
        }
        Err(e) => {
            append_log(&ctx.log_path, "work", &format!("could not start: {e}")).await;
            report(Phase::Work, PhaseStatus::Failed);
            return NodeExecutionOutcome::Failed {
                phase: Phase::Work,
                message: format!("work could not start: {e}"),
            };
        }
    }

    if let Some(postcheck) = &node.postchecks {
        report(Phase::Postcheck, PhaseStatus::Running);
        match run_work_spec(postcheck, &ctx.worktree_path, timeout, progress).await {
            Ok(outcome) if outcome.succeeded() => {
                append_log(&ctx.log_path, "postcheck", &phase_log_body(&outcome)).await;
                report(Phase::Postcheck, PhaseStatus::Passed);
            }
            Ok(outcome) => {
                append_log(&ctx.log_path, "postcheck", &phase_log_body(&outcome)).await;
                report(Phase::Postcheck, PhaseStatus::Failed);
                return NodeExecutionOutcome::Failed {
                    phase: Phase::Postcheck,
                    message: format!("postcheck failed: {}", outcome.stderr),
                };
            }
            Err(e) => {
                append_log(&ctx.log_path, "postcheck", &format!("could not start: {e}")).await;
                report(Phase::Postcheck, PhaseStatus::Failed);
                return NodeExecutionOutcome::Failed {
                    phase: Phase::Postcheck,
                    message: format!("postcheck could not start: {e}"),
                };
            }
        }
    } else {
        report(Phase::Postcheck, PhaseStatus::Skipped);
    }

    report(Phase::Commit, PhaseStatus::Running);
    let outcome = commit_phase(ctx).await;
    let body = match &outcome {
        NodeExecutionOutcome::Succeeded { commit } => format!("committed {commit}"),
        NodeExecutionOutcome::Failed { message, .. } => message.clone(),
    };
    append_log(&ctx.log_path, "commit", &body).await;
    report(
        Phase::Commit,
        if matches!(outcome, NodeExecutionOutcome::Succeeded { .. }) {
            PhaseStatus::Passed
        } else {
            PhaseStatus::Failed
        },
    );
    outcome
}

/// §3 invariant 5: a successful node has exactly one commit id recorded,
/// or `NO_CHANGES` when `expectsNoChanges` and the tree is clean. A clean
/// tree without `expectsNoChanges` is a failure requiring evidence.
///
/// The git plumbing itself is synchronous, run on a blocking thread via
/// `spawn_blocking` -- the same split `worktree::WorktreeManager` uses
/// between its own synchronous git calls and the async call sites that
/// invoke them.
async fn commit_phase(ctx: &NodeExecutionContext) -> NodeExecutionOutcome {
    let worktree_path = ctx.worktree_path.clone();
    let node_name = ctx.node_name.clone();
    let expects_no_changes = ctx.expects_no_changes;

    tokio::task::spawn_blocking(move || commit_phase_blocking(&worktree_path, &node_name, expects_no_changes))
        .await
        .unwrap_or_else(|e| NodeExecutionOutcome::Failed {
            phase: Phase::Commit,
            message: format!("commit phase task panicked: {e}"),
        })
}

fn commit_phase_blocking(worktree_path: &Path, node_name: &str, expects_no_changes: bool) -> NodeExecutionOutcome {
    let status = match std::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(worktree_path)
        .output()
    {
        Ok(o) => o,
        Err(e) => {
            return NodeExecutionOutcome::Failed {
                phase: Phase::Commit,
                message: format!("git status failed: {e}"),
            }
        }
    };

    let dirty = !String::from_utf8_lossy(&status.stdout).trim().is_empty();

    if !dirty {
        return if expects_no_changes {
            NodeExecutionOutcome::Succeeded {
                commit: NO_CHANGES_SENTINEL.to_string(),
            }
        } else {
            NodeExecutionOutcome::Failed {
                phase: Phase::Commit,
                message: "work produced no changes but expectsNoChanges was false".to_string(),
            }
        };
    }

    let add = std::process::Command::new("git")
        .args(["add", "-A"])
        .current_dir(worktree_path)
        .output();
    if let Err(e) = add {
        return NodeExecutionOutcome::Failed {
            phase: Phase::Commit,
            message: format!("git add failed: {e}"),
        };
    }

    let message = format!("{node_name}: automated commit");
    let commit = std::process::Command::new("git")
        .args(["commit", "-m", &message])
        .current_dir(worktree_path)
        .output();

    match commit {
        Ok(o) if o.status.success() => {}
        Ok(o) => {
            return NodeExecutionOutcome::Failed {
                phase: Phase::Commit,
                message: format!("git commit failed: {}", String::from_utf8_lossy(&o.stderr)),
            }
        }
        Err(e) => {
            return NodeExecutionOutcome::Failed {
                phase: Phase::Commit,
                message: format!("git commit could not run: {e}"),
            }
        }
    }

    let rev_parse = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(worktree_path)
        .output();

    match rev_parse {
        Ok(o) if o.status.success() => NodeExecutionOutcome::Succeeded {
            commit: String::from_utf8_lossy(&o.stdout).trim().to_string(),
        },
        Ok(o) => NodeExecutionOutcome::Failed {
            phase: Phase::Commit,
            message: format!("git rev-parse HEAD failed: {}", String::from_utf8_lossy(&o.stderr)),
        },
        Err(e) => NodeExecutionOutcome::Failed {
            phase: Phase::Commit,
            message: format!("git rev-parse HEAD could not run: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_captures_stdout() {
        let outcome = run_command("echo", &["hello".to_string()], Path::new("/tmp"), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let outcome = run_command("sleep", &["5".to_string()], Path::new("/tmp"), Duration::from_millis(100), None)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.succeeded());
        assert_eq!(outcome.stderr, "Command timed out after 100ms");
    }

    #[tokio::test]
    async fn run_command_reports_nonzero_exit() {
        let outcome = run_command("false", &[], Path::new("/tmp"), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(1));
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn shell_invocation_runs_command_string() {
        let outcome = run_work_spec(
            &WorkSpec::Shell {
                command: "echo shelled".to_string(),
                shell: Shell::Sh,
            },
            Path::new("/tmp"),
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap();
        assert!(outcome.succeeded());
        assert!(outcome.stdout.contains("shelled"));
    }

    #[tokio::test]
    async fn run_command_reports_pid_while_running() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        run_command("echo", &["hi".to_string()], Path::new("/tmp"), Duration::from_secs(5), Some(&tx))
            .await
            .unwrap();
        drop(tx);
        let mut saw_pid = false;
        let mut saw_clear = false;
        while let Some(event) = rx.recv().await {
            match event {
                NodeProgress::Pid(Some(_)) => saw_pid = true,
                NodeProgress::Pid(None) => saw_clear = true,
                NodeProgress::Phase(..) => {}
            }
        }
        assert!(saw_pid, "expected a Pid(Some(_)) event while the child ran");
        assert!(saw_clear, "expected a Pid(None) event once the child finished");
    }
}
