//! Global Capacity Registry (component E, §4.7).
//!
//! Coordinates concurrent job count across independent orchestrator
//! instances sharing a host, via a shared file at
//! `<globalStorage>/capacity-registry.json`. The registry is advisory and
//! best-effort (§9 Open Question 2, decided in DESIGN.md): it never refuses
//! a reservation on its own, it only reports capacity for the scheduler to
//! respect.

use std::path::PathBuf;
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::StoreError;

const STALE_HEARTBEAT: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub instance_id: String,
    pub process_id: u32,
    pub running_jobs: u32,
    pub last_heartbeat: u64,
    pub active_plans: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default = "default_version")]
    pub version: u32,
    pub global_max_parallel: u32,
    #[serde(default)]
    pub instances: Vec<InstanceEntry>,
}

fn default_version() -> u32 {
    1
}

impl RegistryFile {
    fn new(global_max_parallel: u32) -> Self {
        Self {
            version: 1,
            global_max_parallel,
            instances: Vec::new(),
        }
    }
}

/// Derives a stable instance id from the workspace path and PID, per
/// §4.7 "each instance registers itself with a stable instanceId derived
/// from workspace path and PID".
pub fn derive_instance_id(workspace_path: &std::path::Path) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    workspace_path.hash(&mut hasher);
    format!("{:x}-{}", hasher.finish(), process::id())
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Client for the shared capacity registry file.
pub struct CapacityRegistry {
    path: PathBuf,
    instance_id: String,
    global_max_parallel: u32,
}

impl CapacityRegistry {
    pub fn new(global_storage_dir: impl Into<PathBuf>, instance_id: String, global_max_parallel: u32) -> Self {
        Self {
            path: global_storage_dir.into().join("capacity-registry.json"),
            instance_id,
            global_max_parallel,
        }
    }

    async fn read(&self) -> Result<RegistryFile, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(StoreError::Deserialize),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(RegistryFile::new(self.global_max_parallel))
            }
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn write(&self, file: &RegistryFile) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(file).map_err(StoreError::Serialize)?;
        write_atomic(&self.path, &json, &self.instance_id)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    /// Register this instance and prune stale entries (heartbeat older
    /// than 30s or process not alive), as a side effect of registering
    /// (§4.7 "Protocol").
    pub async fn register(&self) -> Result<(), StoreError> {
        let mut file = self.read().await.unwrap_or_else(|_| RegistryFile::new(self.global_max_parallel));
        self.prune_stale(&mut file);

        if let Some(entry) = file.instances.iter_mut().find(|i| i.instance_id == self.instance_id) {
            entry.process_id = process::id();
            entry.last_heartbeat = now_secs();
        } else {
            file.instances.push(InstanceEntry {
                instance_id: self.instance_id.clone(),
                process_id: process::id(),
                running_jobs: 0,
                last_heartbeat: now_secs(),
                active_plans: Vec::new(),
            });
        }

        self.write(&file).await
    }

    /// Heartbeat with this instance's current job count. Recreates the
    /// registry file if it was deleted underneath the runner (boundary
    /// behavior, §8).
    pub async fn heartbeat(&self, running_jobs: u32, active_plans: Vec<String>) -> Result<(), StoreError> {
        let mut file = self.read().await.unwrap_or_else(|_| RegistryFile::new(self.global_max_parallel));
        self.prune_stale(&mut file);

        if let Some(entry) = file.instances.iter_mut().find(|i| i.instance_id == self.instance_id) {
            entry.running_jobs = running_jobs;
            entry.last_heartbeat = now_secs();
            entry.active_plans = active_plans;
        } else {
            file.instances.push(InstanceEntry {
                instance_id: self.instance_id.clone(),
                process_id: process::id(),
                running_jobs,
                last_heartbeat: now_secs(),
                active_plans,
            });
        }

        self.write(&file).await
    }

    fn prune_stale(&self, file: &mut RegistryFile) {
        let now = now_secs();
        file.instances.retain(|i| {
            let fresh = now.saturating_sub(i.last_heartbeat) < STALE_HEARTBEAT.as_secs();
            fresh && is_process_alive(i.process_id)
        });
    }

    /// `max(0, globalMaxParallel - sum(runningJobs))`. On a read failure
    /// falls back to a local-only calculation supplied by the caller.
    pub async fn available_capacity(&self, local_fallback: u32) -> u32 {
        match self.read().await {
            Ok(file) => {
                let total_running: u32 = file.instances.iter().map(|i| i.running_jobs).sum();
                file.global_max_parallel.saturating_sub(total_running)
            }
            Err(e) => {
                tracing::warn!(error = %e, "capacity registry read failed, falling back to local-only");
                local_fallback
            }
        }
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) delivers no signal; it only checks existence and
    // permission, matching the Process Monitor's `isRunning` contract.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn register_then_available_capacity() {
        let dir = TempDir::new().unwrap();
        let registry = CapacityRegistry::new(dir.path(), "inst-a".into(), 10);
        registry.register().await.unwrap();
        registry.heartbeat(3, vec!["plan-1".into()]).await.unwrap();

        let cap = registry.available_capacity(99).await;
        assert_eq!(cap, 7);
    }

    #[tokio::test]
    async fn missing_registry_file_falls_back_gracefully_then_recreates() {
        let dir = TempDir::new().unwrap();
        let registry = CapacityRegistry::new(dir.path(), "inst-b".into(), 5);
        // No file yet: available_capacity should read the default (no
        // instances registered) rather than erroring.
        let cap = registry.available_capacity(1).await;
        assert_eq!(cap, 5);

        registry.heartbeat(2, vec![]).await.unwrap();
        assert!(dir.path().join("capacity-registry.json").exists());
    }

    #[tokio::test]
    async fn stale_instances_are_pruned_on_register() {
        let dir = TempDir::new().unwrap();
        let registry_a = CapacityRegistry::new(dir.path(), "inst-stale".into(), 10);
        registry_a.register().await.unwrap();

        // Hand-craft a stale entry with a dead PID and an old heartbeat.
        let mut file: RegistryFile = {
            let bytes = tokio::fs::read(dir.path().join("capacity-registry.json")).await.unwrap();
            serde_json::from_slice(&bytes).unwrap()
        };
        file.instances.push(InstanceEntry {
            instance_id: "dead-instance".into(),
            process_id: 999_999_999,
            running_jobs: 4,
            last_heartbeat: 0,
            active_plans: vec![],
        });
        let json = serde_json::to_vec_pretty(&file).unwrap();
        tokio::fs::write(dir.path().join("capacity-registry.json"), json).await.unwrap();

        let registry_b = CapacityRegistry::new(dir.path(), "inst-fresh".into(), 10);
        registry_b.register().await.unwrap();

        let bytes = tokio::fs::read(dir.path().join("capacity-registry.json")).await.unwrap();
        let file: RegistryFile = serde_json::from_slice(&bytes).unwrap();
        assert!(!file.instances.iter().any(|i| i.instance_id == "dead-instance"));
    }
}
