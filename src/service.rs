use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServiceConfig;
use crate::error::{DockhandError, Result};
use crate::queue::{JobService, RedisQueue, TASK_QUEUE_KEY};
use crate::store::{select_store, RedisHandle, SharedJobStore};
use crate::task::TaskExecutor;
use crate::worker::{QueueConsumer, WorkerPool};

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-lifetime context wiring the store, executor, pool and queue.
///
/// Built once at start-up and handed to whatever needs it; torn down with
/// [`shutdown`](Self::shutdown).
pub struct Service {
    config: ServiceConfig,
    redis: Option<RedisHandle>,
    executor: TaskExecutor,
    pool: WorkerPool,
    jobs: JobService,
}

impl Service {
    /// Connect to Redis when configured, falling back to the in-memory store
    /// and in-process execution when it is unreachable.
    pub async fn start(config: ServiceConfig) -> Self {
        let redis = match config.store.redis_url.as_deref() {
            Some(url) => match RedisHandle::connect(url, REDIS_CONNECT_TIMEOUT).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Redis unavailable, falling back to in-memory store and in-process execution"
                    );
                    None
                }
            },
            None => None,
        };
        Self::with_redis(config, redis)
    }

    /// Wire the components around an optional, already connected Redis.
    pub fn with_redis(config: ServiceConfig, redis: Option<RedisHandle>) -> Self {
        let store = select_store(redis.as_ref());
        let executor = TaskExecutor::new(store.clone(), config.clone());
        let pool = WorkerPool::new(executor.clone());
        let jobs = match redis {
            Some(ref handle) => JobService::with_queue(
                store,
                Arc::new(RedisQueue::new(handle.manager())),
                pool.clone(),
            ),
            None => JobService::local(store, pool.clone()),
        };

        tracing::info!(
            store = jobs.store().backend(),
            queue = jobs.queue_name(),
            slots = executor.capacity(),
            "Service initialised"
        );

        Self {
            config,
            redis,
            executor,
            pool,
            jobs,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedJobStore {
        self.jobs.store()
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            service: self.jobs.clone(),
            executor: self.executor.clone(),
        }
    }

    /// Consumer for the external work queue, when one is configured.
    pub fn consumer(&self) -> Option<QueueConsumer> {
        self.redis
            .as_ref()
            .map(|handle| QueueConsumer::new(handle.clone(), TASK_QUEUE_KEY, self.pool.clone()))
    }

    /// Run the HTTP API, plus the queue consumer when Redis is configured,
    /// until `shutdown` fires. In-flight tasks are drained before returning.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let consumer = self.consumer().map(|consumer| {
            let token = shutdown.clone();
            tokio::spawn(consumer.run(token))
        });

        let result = run_api(self.config.listen_addr, self.api_state(), shutdown.clone()).await;
        // A failed bind must still stop the consumer.
        shutdown.cancel();

        if let Some(handle) = consumer {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue consumer aborted");
            }
        }
        self.shutdown().await;
        result
    }

    /// Run only the queue consumer until `shutdown` fires.
    pub async fn run_worker(self, shutdown: CancellationToken) -> Result<()> {
        let consumer = self.consumer().ok_or_else(|| {
            DockhandError::Config("worker mode requires a reachable REDIS_URL".to_string())
        })?;
        consumer.run(shutdown).await;
        self.shutdown().await;
        Ok(())
    }

    /// Wait for every task running in this process to finish.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        tracing::info!("Service stopped");
    }
}
