//! Queue/Resubmission Layer.
//!
//! A [`TaskQueue`] hands a task to whatever execution mechanism is
//! configured: the external Redis work queue ([`RedisQueue`]) or the
//! in-process worker pool ([`LocalQueue`]). Both run the same executor; the
//! local one only loses pending work on restart.
//!
//! # Ordering precondition
//!
//! Callers must write `queued` to the Job Store *before* calling
//! [`TaskQueue::enqueue`], never after. Once a task is enqueued a worker may
//! finish it at any moment; a late `queued` write would overwrite its
//! terminal state. [`JobService`] is the only caller and follows this rule.

pub mod remote;
pub mod service;

use async_trait::async_trait;

use crate::error::Result;
use crate::task::TaskSpec;
use crate::worker::WorkerPool;

pub use remote::{pop_task, RedisQueue, TASK_QUEUE_KEY};
pub use service::{FailedJob, JobService, ResubmitOutcome, ResubmitReport, SkippedJob};

/// Schedules a task for asynchronous execution.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn name(&self) -> &'static str;

    /// Precondition: the job exists in the store with state `queued`.
    async fn enqueue(&self, spec: TaskSpec) -> Result<()>;
}

/// Runs tasks on the in-process worker pool.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    pool: WorkerPool,
}

impl LocalQueue {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn enqueue(&self, spec: TaskSpec) -> Result<()> {
        self.pool.spawn(spec);
        Ok(())
    }
}
