mod dispatch_cmd;
mod log_cmd;
mod plan_cmds;
mod serve_cmd;
mod status_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use runner_core::config::RunnerConfig;
use runner_core::facade::PlanRunner;

#[derive(Parser)]
#[command(name = "planrunner", about = "DAG job orchestrator for repository-scoped work")]
struct Cli {
    /// Repository root to operate on (overrides PLANRUNNER_REPO_PATH env var, defaults to cwd)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new plan (JSON, or TOML if the file ends in .toml)
    Enqueue {
        /// Path to the plan file
        file: PathBuf,
    },
    /// Show plan status and per-node state (omit plan_id to list all plans)
    Status {
        /// Plan ID to show status for (omit to list all plans)
        plan_id: Option<String>,
    },
    /// List every plan known to this instance
    List,
    /// Show one node's runtime state
    Node {
        plan_id: String,
        producer_id: String,
    },
    /// Show a node's attempt log
    Logs {
        plan_id: String,
        producer_id: String,
        /// Attempt number (defaults to the most recent attempt)
        #[arg(long)]
        attempt: Option<u32>,
    },
    /// Show why a failed or blocked node stopped
    Failure {
        plan_id: String,
        producer_id: String,
    },
    /// Pause a plan: in-flight nodes finish, no new nodes start
    Pause { plan_id: String },
    /// Resume a paused plan
    Resume { plan_id: String },
    /// Cancel a plan: abandon everything not already terminal
    Cancel { plan_id: String },
    /// Delete a terminal plan's record
    Delete { plan_id: String },
    /// Retry a failed or blocked node
    RetryNode {
        plan_id: String,
        producer_id: String,
        /// Discard the node's existing worktree before retrying
        #[arg(long)]
        clear_worktree: bool,
    },
    /// Force a node to its failed state, bypassing retries
    ForceFail {
        plan_id: String,
        producer_id: String,
    },
    /// Apply a batch of structural edits (JSON array of reshape ops) to a live plan
    Reshape {
        plan_id: String,
        file: PathBuf,
    },
    /// Run the HTTP status/control API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Generate shell completion scripts
    Completions {
        shell: Shell,
    },
}

async fn build_runner(repo: Option<PathBuf>) -> anyhow::Result<Arc<PlanRunner>> {
    let repo_path = repo
        .or_else(|| std::env::var_os("PLANRUNNER_REPO_PATH").map(PathBuf::from))
        .map(Ok)
        .unwrap_or_else(std::env::current_dir)
        .context("resolving repository path")?;
    let config = RunnerConfig::resolve(repo_path);
    PlanRunner::bootstrap(config).await.context("bootstrapping plan runner")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runner_core::telemetry::init_tracing();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    match cli.command {
        Commands::Enqueue { file } => {
            let runner = build_runner(cli.repo).await?;
            plan_cmds::run_enqueue(&runner, &file).await?;
        }
        Commands::Status { plan_id } => {
            let runner = build_runner(cli.repo).await?;
            status_cmd::run_status(&runner, plan_id.as_deref()).await?;
        }
        Commands::List => {
            let runner = build_runner(cli.repo).await?;
            status_cmd::run_status(&runner, None).await?;
        }
        Commands::Node { plan_id, producer_id } => {
            let runner = build_runner(cli.repo).await?;
            status_cmd::run_node(&runner, &plan_id, &producer_id).await?;
        }
        Commands::Logs {
            plan_id,
            producer_id,
            attempt,
        } => {
            let runner = build_runner(cli.repo).await?;
            log_cmd::run_logs(&runner, &plan_id, &producer_id, attempt).await?;
        }
        Commands::Failure { plan_id, producer_id } => {
            let runner = build_runner(cli.repo).await?;
            log_cmd::run_failure(&runner, &plan_id, &producer_id).await?;
        }
        Commands::Pause { plan_id } => {
            let runner = build_runner(cli.repo).await?;
            plan_cmds::run_pause(&runner, &plan_id).await?;
        }
        Commands::Resume { plan_id } => {
            let runner = build_runner(cli.repo).await?;
            plan_cmds::run_resume(&runner, &plan_id).await?;
        }
        Commands::Cancel { plan_id } => {
            let runner = build_runner(cli.repo).await?;
            plan_cmds::run_cancel(&runner, &plan_id).await?;
        }
        Commands::Delete { plan_id } => {
            let runner = build_runner(cli.repo).await?;
            plan_cmds::run_delete(&runner, &plan_id).await?;
        }
        Commands::RetryNode {
            plan_id,
            producer_id,
            clear_worktree,
        } => {
            let runner = build_runner(cli.repo).await?;
            dispatch_cmd::run_retry_node(&runner, &plan_id, &producer_id, clear_worktree).await?;
        }
        Commands::ForceFail { plan_id, producer_id } => {
            let runner = build_runner(cli.repo).await?;
            dispatch_cmd::run_force_fail(&runner, &plan_id, &producer_id).await?;
        }
        Commands::Reshape { plan_id, file } => {
            let runner = build_runner(cli.repo).await?;
            dispatch_cmd::run_reshape(&runner, &plan_id, &file).await?;
        }
        Commands::Serve { bind, port } => {
            let runner = build_runner(cli.repo).await?;
            let (_pump, _heartbeat) = runner.run_background_loops();
            serve_cmd::run_serve(runner, &bind, port).await?;
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
