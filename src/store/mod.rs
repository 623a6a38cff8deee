//! Job Store: the concurrency-safe record of job state and ordered logs.
//!
//! Two backends implement [`JobStore`] with identical external behavior:
//!
//! - [`InMemoryJobStore`]: process-local map guarded by a single lock
//! - [`RedisJobStore`]: one hash per job in a remote Redis instance
//!
//! # Contract
//!
//! - `create` is idempotent: re-creating a known id overwrites its state only
//!   and never touches its logs.
//! - `create_new` is the atomic create-if-absent used for submissions; it
//!   never touches an existing job.
//! - `set_state` and `append_log` never fail towards the caller. Unknown ids
//!   are ignored and backend errors are logged, because both are called from
//!   cleanup and error paths.
//! - `get` and `list` return owned snapshots.
//! - Jobs are never deleted by the store.

pub mod job;
pub mod memory;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;

pub use job::{Job, JobMetadata, JobState};
pub use memory::InMemoryJobStore;
pub use remote::{RedisHandle, RedisJobStore};

use crate::error::Result;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short backend name for health reporting.
    fn backend(&self) -> &'static str;

    async fn create(&self, id: &str, state: JobState, logs: Vec<String>) -> Result<()>;

    /// Create `id` only if it is unknown. Returns `false`, and changes
    /// nothing, when the id already exists.
    async fn create_new(&self, id: &str, state: JobState, logs: Vec<String>) -> Result<bool>;

    async fn set_state(&self, id: &str, state: JobState);

    async fn append_log(&self, id: &str, line: &str);

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// All known jobs, oldest first.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Replace the metadata remembered for `id`.
    async fn set_metadata(&self, id: &str, metadata: &JobMetadata) -> Result<()>;

    async fn metadata(&self, id: &str) -> Result<Option<JobMetadata>>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

/// Pick the store backend: Redis when a handle is available, memory otherwise.
pub fn select_store(redis: Option<&RedisHandle>) -> SharedJobStore {
    match redis {
        Some(handle) => {
            tracing::info!("Using Redis job store");
            Arc::new(RedisJobStore::new(handle.manager()))
        }
        None => {
            tracing::info!("Using in-memory job store");
            Arc::new(InMemoryJobStore::new())
        }
    }
}
