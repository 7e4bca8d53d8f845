//! Persistence Store (component D, §4.5).
//!
//! Each plan persists as a single JSON document at
//! `<repo>/.orchestrator/plans/<planId>.json`; a side index file lists plan
//! ids. Writes are debounced at 500ms and coalesced per plan -- a burst of
//! mutations to the same plan within the debounce window produces one
//! write of the latest state, not one write per mutation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::atomic::{write_atomic, write_atomic_sync};
use crate::StoreError;

const DEBOUNCE: Duration = Duration::from_millis(500);

struct PendingWrite {
    /// Cancels the in-flight debounce timer when a newer write supersedes it.
    generation: u64,
}

/// Debounced, atomic, per-plan JSON persistence.
///
/// Only one write is in flight per plan at a time; a `save` call that
/// arrives while a debounce timer is pending simply bumps the pending
/// generation so the timer, when it fires, writes the latest snapshot
/// instead of the one requested first.
pub struct PlanStore {
    root: PathBuf,
    instance_id: String,
    pending: Mutex<HashMap<String, PendingWrite>>,
    inflight: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PlanStore {
    pub fn new(repo_path: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        let root = repo_path.into().join(".orchestrator").join("plans");
        Self {
            root,
            instance_id: instance_id.into(),
            pending: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, plan_id: &str) -> PathBuf {
        self.root.join(format!("{plan_id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("_index.json")
    }

    /// Debounced save: schedules a write 500ms out, coalescing with any
    /// write already pending for this plan.
    pub async fn save_debounced<T: Serialize + Send + Sync + 'static>(
        self: &Arc<Self>,
        plan_id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
        let plan_id = plan_id.to_string();

        let generation = {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(plan_id.clone()).or_insert(PendingWrite { generation: 0 });
            entry.generation += 1;
            entry.generation
        };

        let store = Arc::clone(self);
        let task_plan_id = plan_id.clone();
        let handle = tokio::spawn(async move {
            let plan_id = task_plan_id;
            tokio::time::sleep(DEBOUNCE).await;
            let should_write = {
                let pending = store.pending.lock().await;
                pending.get(&plan_id).map(|p| p.generation) == Some(generation)
            };
            if !should_write {
                return;
            }
            let path = store.path_for(&plan_id);
            if let Err(e) = write_atomic(&path, &json, &store.instance_id).await {
                tracing::warn!(plan_id, error = %e, "debounced plan write failed");
            }
            store.pending.lock().await.remove(&plan_id);
            store.inflight.lock().await.remove(&plan_id);
        });

        let mut inflight = self.inflight.lock().await;
        if let Some(old) = inflight.insert(plan_id.clone(), handle) {
            old.abort();
        }

        Ok(())
    }

    /// Synchronous save bypassing debouncing, used on shutdown (§4.5).
    pub fn save_sync<T: Serialize>(&self, plan_id: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
        write_atomic_sync(&self.path_for(plan_id), &json, &self.instance_id)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    pub async fn load<T: DeserializeOwned>(&self, plan_id: &str) -> Result<T, StoreError> {
        let bytes = tokio::fs::read(self.path_for(plan_id))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(StoreError::Deserialize)
    }

    pub async fn delete(&self, plan_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(plan_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    /// Load every plan file under `plans/` at startup. A corrupt file is
    /// skipped with a logged error and does not abort bootstrap (§4.5
    /// "Read protocol").
    pub async fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>, StoreError> {
        let mut loaded = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(loaded),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        while let Some(entry) = dir.next_entry().await.map_err(|e| StoreError::Io(e.to_string()))? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == "_index" || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => loaded.push((stem.to_string(), value)),
                    Err(e) => tracing::error!(path = %path.display(), error = %e, "skipping corrupt plan file"),
                },
                Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to read plan file"),
            }
        }

        Ok(loaded)
    }

    pub async fn write_index(&self, plan_ids: &HashSet<String>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(plan_ids).map_err(StoreError::Serialize)?;
        write_atomic(&self.index_path(), &json, &self.instance_id)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Cancel any pending debounce timers and flush synchronously. Called on
/// shutdown (§4.5): the synchronous save path bypasses debouncing and
/// cancels any pending timer.
pub async fn flush_on_shutdown<T: Serialize>(store: &PlanStore, pending: &[(String, T)]) {
    let mut inflight = store.inflight.lock().await;
    for (_, handle) in inflight.drain() {
        handle.abort();
    }
    drop(inflight);
    store.pending.lock().await.clear();

    for (plan_id, value) in pending {
        if let Err(e) = store.save_sync(plan_id, value) {
            tracing::error!(plan_id, error = %e, "failed to flush plan on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        value: u32,
    }

    #[tokio::test]
    async fn debounced_save_coalesces_and_writes_latest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PlanStore::new(dir.path(), "inst-1"));

        store.save_debounced("plan-1", &Dummy { value: 1 }).await.unwrap();
        store.save_debounced("plan-1", &Dummy { value: 2 }).await.unwrap();
        store.save_debounced("plan-1", &Dummy { value: 3 }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;

        let loaded: Dummy = store.load("plan-1").await.unwrap();
        assert_eq!(loaded, Dummy { value: 3 });
    }

    #[tokio::test]
    async fn load_all_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path(), "inst-1");
        store.save_sync("good", &Dummy { value: 7 }).unwrap();

        let bad_path = dir.path().join(".orchestrator/plans/bad.json");
        tokio::fs::write(&bad_path, b"{not valid json").await.unwrap();

        let loaded: Vec<(String, Dummy)> = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "good");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path(), "inst-1");
        store.save_sync("plan-x", &Dummy { value: 1 }).unwrap();
        store.delete("plan-x").await.unwrap();
        store.delete("plan-x").await.unwrap();
    }
}
