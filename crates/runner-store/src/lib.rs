//! File-backed persistence for the plan runner: debounced atomic JSON
//! plan storage (component D) and the cross-instance global capacity
//! registry (component E).
//!
//! Grounded on the write-to-temp + fsync + rename pattern for atomic file
//! writes; there is no database here by design (§4.5 calls for a single
//! JSON document per plan, not a SQL store).

pub mod atomic;
pub mod plan_store;
pub mod registry;

pub use atomic::{write_atomic, write_atomic_sync, AtomicWriteError};
pub use plan_store::{flush_on_shutdown, PlanStore};
pub use registry::{CapacityRegistry, InstanceEntry, RegistryFile};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("failed to serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl From<AtomicWriteError> for StoreError {
    fn from(e: AtomicWriteError) -> Self {
        StoreError::Io(e.to_string())
    }
}
