//! Runtime configuration (§4.8).
//!
//! Resolution order, mirroring a typical `resolve()` layering: an
//! optional `planrunner.toml` in the repository root, overridden by
//! `PLANRUNNER_*` environment variables, with hard-coded defaults as the
//! final fallback. There is no CLI-flag tier here -- that lives in
//! `runner-cli`, which resolves its own flags before handing a finished
//! `RunnerConfig` to the facade.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// On-disk `planrunner.toml` shape. Every field is optional; absent fields
/// fall through to the environment, then to [`RunnerConfig::default`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub worktree_root: Option<PathBuf>,
    pub global_storage_dir: Option<PathBuf>,
    pub default_max_parallel: Option<u32>,
    pub command_timeout_secs: Option<u64>,
    pub snapshot_ttl_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub pump_interval_ms: Option<u64>,
    pub conflict_resolver_timeout_secs: Option<u64>,
    #[serde(default)]
    pub webhook_subscribers: Vec<String>,
}

/// Fully resolved configuration, ready for use by the facade and CLI.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub repo_path: PathBuf,
    pub worktree_root: PathBuf,
    pub global_storage_dir: PathBuf,
    pub default_max_parallel: u32,
    pub command_timeout: Duration,
    pub snapshot_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub pump_interval: Duration,
    pub conflict_resolver_timeout: Duration,
    pub webhook_subscribers: Vec<String>,
}

fn config_path(repo_path: &Path) -> PathBuf {
    repo_path.join("planrunner.toml")
}

/// Default global storage directory: a per-user state dir via `dirs`,
/// falling back to `.` if the platform has no notion of one.
fn default_global_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("planrunner")
}

impl RunnerConfig {
    /// Resolve configuration for `repo_path`: file < env < hard-coded
    /// default, in ascending priority.
    pub fn resolve(repo_path: impl Into<PathBuf>) -> Self {
        let repo_path = repo_path.into();
        let file: ConfigFile = std::fs::read_to_string(config_path(&repo_path))
            .ok()
            .and_then(|raw| match toml::from_str(&raw) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse planrunner.toml, ignoring");
                    None
                }
            })
            .unwrap_or_default();

        let worktree_root = env_path("PLANRUNNER_WORKTREE_ROOT")
            .or(file.worktree_root)
            .unwrap_or_else(|| repo_path.join(".orchestrator").join("worktrees"));

        let global_storage_dir = env_path("PLANRUNNER_GLOBAL_STORAGE_DIR")
            .or(file.global_storage_dir)
            .unwrap_or_else(default_global_storage_dir);

        let default_max_parallel = env_u64("PLANRUNNER_DEFAULT_MAX_PARALLEL")
            .map(|v| v as u32)
            .or(file.default_max_parallel)
            .unwrap_or(4);

        let command_timeout = Duration::from_secs(
            env_u64("PLANRUNNER_COMMAND_TIMEOUT_SECS")
                .or(file.command_timeout_secs)
                .unwrap_or(60),
        );

        let snapshot_ttl = Duration::from_secs(
            env_u64("PLANRUNNER_SNAPSHOT_TTL_SECS")
                .or(file.snapshot_ttl_secs)
                .unwrap_or(2),
        );

        let heartbeat_interval = Duration::from_secs(
            env_u64("PLANRUNNER_HEARTBEAT_INTERVAL_SECS")
                .or(file.heartbeat_interval_secs)
                .unwrap_or(5),
        );

        let pump_interval = Duration::from_millis(
            env_u64("PLANRUNNER_PUMP_INTERVAL_MS")
                .or(file.pump_interval_ms)
                .unwrap_or(500),
        );

        let conflict_resolver_timeout = Duration::from_secs(
            env_u64("PLANRUNNER_CONFLICT_RESOLVER_TIMEOUT_SECS")
                .or(file.conflict_resolver_timeout_secs)
                .unwrap_or(5 * 60),
        );

        let webhook_subscribers = std::env::var("PLANRUNNER_WEBHOOK_SUBSCRIBERS")
            .ok()
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or(file.webhook_subscribers);

        Self {
            repo_path,
            worktree_root,
            global_storage_dir,
            default_max_parallel,
            command_timeout,
            snapshot_ttl,
            heartbeat_interval,
            pump_interval,
            conflict_resolver_timeout,
            webhook_subscribers,
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_defaults_with_no_file_or_env() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = RunnerConfig::resolve(tmp.path());
        assert_eq!(cfg.default_max_parallel, 4);
        assert_eq!(cfg.pump_interval, Duration::from_millis(500));
        assert_eq!(cfg.worktree_root, tmp.path().join(".orchestrator").join("worktrees"));
    }

    #[test]
    fn resolve_reads_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            config_path(tmp.path()),
            "default_max_parallel = 8\npump_interval_ms = 250\n",
        )
        .unwrap();
        let cfg = RunnerConfig::resolve(tmp.path());
        assert_eq!(cfg.default_max_parallel, 8);
        assert_eq!(cfg.pump_interval, Duration::from_millis(250));
    }

    #[test]
    fn env_var_overrides_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(config_path(tmp.path()), "default_max_parallel = 8\n").unwrap();
        unsafe { std::env::set_var("PLANRUNNER_DEFAULT_MAX_PARALLEL", "16") };
        let cfg = RunnerConfig::resolve(tmp.path());
        unsafe { std::env::remove_var("PLANRUNNER_DEFAULT_MAX_PARALLEL") };
        assert_eq!(cfg.default_max_parallel, 16);
    }
}
