use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServiceConfig;
use crate::error::{DockhandError, Result};
use crate::store::{JobState, SharedJobStore};
use crate::task::spec::TaskSpec;
use crate::task::{build, deploy, JobLog, StepContext};
use crate::workspace::Workspace;

/// Runs tasks end to end behind a fixed pool of Execution Slots.
///
/// A task holds its slot from the `running` transition until its workspace
/// has been removed and its final state written. Callers beyond the pool
/// size wait for a slot instead of failing.
#[derive(Clone)]
pub struct TaskExecutor {
    store: SharedJobStore,
    slots: Arc<Semaphore>,
    capacity: usize,
    config: Arc<ServiceConfig>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .field("store", &self.store.backend())
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(store: SharedJobStore, config: ServiceConfig) -> Self {
        let capacity = config.max_concurrent_tasks.max(1);
        Self {
            store,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by running tasks.
    pub fn busy_slots(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Wait for a free Execution Slot.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DockhandError::Internal("execution slot pool closed".to_string()))
    }

    /// Acquire a slot, then run `spec` to a terminal state.
    pub async fn execute(&self, spec: TaskSpec) {
        match self.acquire_slot().await {
            Ok(permit) => self.execute_with_slot(permit, spec).await,
            Err(e) => {
                tracing::error!(job_id = %spec.id(), error = %e, "No execution slot");
                self.fail(spec.id(), &e).await;
            }
        }
    }

    /// Run `spec` on an already acquired slot. Never returns an error: every
    /// failure ends as log lines and the `error` state.
    pub async fn execute_with_slot(&self, permit: OwnedSemaphorePermit, spec: TaskSpec) {
        let id = spec.id().to_string();
        let spec = spec.with_defaults();
        tracing::info!(
            job_id = %id,
            kind = spec.kind(),
            dry_run = spec.dry_run(),
            busy = self.busy_slots(),
            "Executing task"
        );
        self.store.set_state(&id, JobState::Running).await;

        let log = JobLog::new(self.store.clone(), id.as_str());
        let result = self.run_steps(&spec, &log).await;

        match result {
            Ok(()) => {
                self.store.set_state(&id, JobState::Done).await;
                tracing::info!(job_id = %id, kind = spec.kind(), state = %JobState::Done, "Task finished");
            }
            Err(e) => {
                tracing::warn!(job_id = %id, kind = spec.kind(), error = %e, "Task failed");
                self.fail(&id, &e).await;
            }
        }
        drop(permit);
    }

    async fn fail(&self, id: &str, error: &DockhandError) {
        self.store.append_log(id, &format!("error: {error}")).await;
        self.store.set_state(id, JobState::Error).await;
    }

    // The workspace is dropped, and removed, before the final state is written.
    async fn run_steps(&self, spec: &TaskSpec, log: &JobLog) -> Result<()> {
        let workspace = Workspace::create()?;
        let ctx = StepContext {
            config: &self.config,
            log,
        };
        match (spec, spec.dry_run()) {
            (TaskSpec::Build(b), true) => {
                build::dry_run(&ctx, b, &workspace).await;
                Ok(())
            }
            (TaskSpec::Build(b), false) => build::run(&ctx, b, &workspace).await,
            (TaskSpec::Deploy(d), true) => {
                deploy::dry_run(&ctx, d, &workspace).await;
                Ok(())
            }
            (TaskSpec::Deploy(d), false) => deploy::run(&ctx, d, &workspace).await,
        }
    }
}
