use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DockhandError, Result};
use crate::queue::{LocalQueue, TaskQueue};
use crate::store::{Job, JobState, SharedJobStore};
use crate::task::{DeploySpec, TaskSpec};
use crate::worker::WorkerPool;

/// Result of resubmitting one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubmitOutcome {
    pub ok: bool,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResubmitOutcome {
    fn requeued(id: &str) -> Self {
        Self {
            ok: true,
            id: id.to_string(),
            reason: None,
        }
    }

    fn skipped(id: &str, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            id: id.to_string(),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedJob {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: String,
    pub error: String,
}

/// Result of [`JobService::resubmit_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubmitReport {
    pub requeued: Vec<String>,
    pub skipped: Vec<SkippedJob>,
    pub errors: Vec<FailedJob>,
}

/// Submission and resubmission of jobs.
///
/// Owns the ordering rule of the queue layer: the store says `queued`
/// before the task reaches any execution mechanism.
#[derive(Clone)]
pub struct JobService {
    store: SharedJobStore,
    queue: Arc<dyn TaskQueue>,
    /// In-process fallback when `queue` is external.
    fallback: Option<LocalQueue>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("store", &self.store.backend())
            .field("queue", &self.queue.name())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl JobService {
    /// Service that executes everything on `pool`.
    pub fn local(store: SharedJobStore, pool: WorkerPool) -> Self {
        Self {
            store,
            queue: Arc::new(LocalQueue::new(pool)),
            fallback: None,
        }
    }

    /// Service that pushes to `queue` and falls back to `pool` when a push
    /// fails.
    pub fn with_queue(store: SharedJobStore, queue: Arc<dyn TaskQueue>, pool: WorkerPool) -> Self {
        Self {
            store,
            queue,
            fallback: Some(LocalQueue::new(pool)),
        }
    }

    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    pub fn queue_name(&self) -> &'static str {
        self.queue.name()
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list().await
    }

    /// Create the job as `queued` and schedule it. Returns the job id.
    ///
    /// A caller-chosen id that already exists is refused with
    /// [`DockhandError::JobExists`] and the existing job is left untouched;
    /// re-running a known job goes through [`resubmit`](Self::resubmit).
    pub async fn submit(&self, spec: TaskSpec) -> Result<String> {
        let spec = spec
            .with_id_if_missing(|| uuid::Uuid::new_v4().to_string())
            .with_defaults();
        let id = spec.id().to_string();

        if !self.store.create_new(&id, JobState::Queued, Vec::new()).await? {
            tracing::warn!(job_id = %id, "Submission refused, job id already exists");
            return Err(DockhandError::JobExists(id));
        }
        // Build inputs may carry credentials and are never persisted.
        if let TaskSpec::Deploy(ref deploy) = spec {
            self.store.set_metadata(&id, &deploy.to_metadata()?).await?;
        }
        tracing::info!(job_id = %id, kind = spec.kind(), queue = self.queue.name(), "Job submitted");

        self.dispatch(spec).await?;
        Ok(id)
    }

    /// Re-run a job from its persisted inputs.
    ///
    /// Without `force` only a job in `error` is re-run: a `done` job is
    /// left untouched and a `queued` or `running` job is skipped so the
    /// same id never has two runs in flight. `force` overrides all three,
    /// for jobs stranded by a worker that died mid-run. The `queued` state
    /// is written before the task is dispatched.
    pub async fn resubmit(&self, id: &str, force: bool) -> Result<ResubmitOutcome> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DockhandError::JobNotFound(id.to_string()))?;

        let Some(metadata) = self.store.metadata(id).await? else {
            return Ok(ResubmitOutcome::skipped(id, "no deploy metadata"));
        };
        let deploy = match DeploySpec::from_metadata(id, &metadata) {
            Ok(deploy) => deploy,
            Err(reason) => return Ok(ResubmitOutcome::skipped(id, reason)),
        };

        if !force {
            let reason = match job.state {
                JobState::Done => Some("already done"),
                JobState::Running => Some("already running"),
                JobState::Queued => Some("already queued"),
                JobState::Error => None,
            };
            if let Some(reason) = reason {
                tracing::info!(job_id = %id, state = %job.state, "Resubmission skipped");
                return Ok(ResubmitOutcome::skipped(id, reason));
            }
        }

        self.store.set_state(id, JobState::Queued).await;
        self.store.append_log(id, "re-enqueued").await;
        tracing::info!(job_id = %id, force, previous = %job.state, "Job resubmitted");

        self.dispatch(TaskSpec::Deploy(deploy)).await?;
        Ok(ResubmitOutcome::requeued(id))
    }

    /// Resubmit every known job, oldest first.
    pub async fn resubmit_all(&self, force: bool) -> Result<ResubmitReport> {
        let mut report = ResubmitReport::default();
        for job in self.store.list().await? {
            match self.resubmit(&job.id, force).await {
                Ok(outcome) if outcome.ok => report.requeued.push(outcome.id),
                Ok(outcome) => report.skipped.push(SkippedJob {
                    id: outcome.id,
                    reason: outcome.reason.unwrap_or_default(),
                }),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Resubmission failed");
                    report.errors.push(FailedJob {
                        id: job.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            requeued = report.requeued.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "Bulk resubmission finished"
        );
        Ok(report)
    }

    // Precondition: the job is already `queued` in the store.
    async fn dispatch(&self, spec: TaskSpec) -> Result<()> {
        let id = spec.id().to_string();
        let Some(ref fallback) = self.fallback else {
            self.store.append_log(&id, "running in-process").await;
            return self.queue.enqueue(spec).await;
        };

        match self.queue.enqueue(spec.clone()).await {
            Ok(()) => {
                self.store.append_log(&id, "enqueued to work queue").await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Enqueue failed, running in-process");
                self.store
                    .append_log(&id, "enqueue to work queue failed; running in-process")
                    .await;
                fallback.enqueue(spec).await
            }
        }
    }
}
