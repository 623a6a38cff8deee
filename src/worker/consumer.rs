use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::pop_task;
use crate::store::RedisHandle;
use crate::worker::WorkerPool;

const POP_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Drains the external work queue into the worker pool.
///
/// A slot is acquired *before* popping, so a saturated pool leaves pending
/// tasks in Redis where another worker process can take them.
#[derive(Debug)]
pub struct QueueConsumer {
    redis: RedisHandle,
    key: String,
    pool: WorkerPool,
}

impl QueueConsumer {
    pub fn new(redis: RedisHandle, key: impl Into<String>, pool: WorkerPool) -> Self {
        Self {
            redis,
            key: key.into(),
            pool,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(queue = %self.key, "Queue consumer started");
        let mut conn = None;

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.pool.executor().acquire_slot() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        tracing::error!(error = %e, "Slot pool closed, stopping consumer");
                        break;
                    }
                },
            };

            if conn.is_none() {
                match self.redis.dedicated_connection().await {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        tracing::warn!(error = %e, "Queue connection failed, retrying");
                        drop(permit);
                        if sleep_or_cancel(&shutdown, RETRY_DELAY).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else { continue };

            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = pop_task(c, &self.key, POP_TIMEOUT) => popped,
            };

            match popped {
                Ok(Some(spec)) => {
                    tracing::info!(job_id = %spec.id(), kind = spec.kind(), "Task dequeued");
                    self.pool.spawn_with_slot(permit, spec);
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    tracing::warn!(error = %e, "Queue pop failed, reconnecting");
                    drop(permit);
                    conn = None;
                    if sleep_or_cancel(&shutdown, RETRY_DELAY).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(queue = %self.key, "Queue consumer stopped");
    }
}

/// Sleep for `delay`; true when cancelled first.
async fn sleep_or_cancel(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
