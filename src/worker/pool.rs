use tokio::sync::OwnedSemaphorePermit;
use tokio_util::task::TaskTracker;

use crate::store::JobState;
use crate::task::{TaskExecutor, TaskSpec};

/// Supervised pool that runs tasks in this process.
///
/// Every task runs inside its own spawned future; if it panics the
/// supervisor records the failure on the job instead of losing it. The pool
/// shares the executor's Execution Slots, so it never runs more tasks at
/// once than the executor allows.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    executor: TaskExecutor,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            executor,
            tracker: TaskTracker::new(),
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Number of tasks spawned and not yet finished, including those still
    /// waiting for a slot.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Run `spec` in the background; it waits for a slot like any other task.
    pub fn spawn(&self, spec: TaskSpec) {
        let executor = self.executor.clone();
        self.supervise(spec, move |spec| async move { executor.execute(spec).await });
    }

    /// Run `spec` in the background on a slot the caller already holds.
    pub fn spawn_with_slot(&self, permit: OwnedSemaphorePermit, spec: TaskSpec) {
        let executor = self.executor.clone();
        self.supervise(spec, move |spec| async move {
            executor.execute_with_slot(permit, spec).await
        });
    }

    fn supervise<F, Fut>(&self, spec: TaskSpec, run: F)
    where
        F: FnOnce(TaskSpec) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = spec.id().to_string();
        let store = self.executor.store().clone();
        let inner = tokio::spawn(run(spec));

        self.tracker.spawn(async move {
            if let Err(e) = inner.await {
                tracing::error!(job_id = %id, error = %e, "Task aborted");
                let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
                store
                    .append_log(&id, &format!("error: task {reason}"))
                    .await;
                store.set_state(&id, JobState::Error).await;
            }
        });
    }

    /// Stop accepting work and wait for every spawned task to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        tracing::info!(in_flight = self.tracker.len(), "Draining worker pool");
        self.tracker.wait().await;
    }
}
