use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};

use crate::error::Result;
use crate::queue::TaskQueue;
use crate::task::TaskSpec;

/// Redis list holding pending tasks as JSON.
pub const TASK_QUEUE_KEY: &str = "dockhand:tasks";

/// Producer side of the external work queue.
///
/// Tasks are pushed with `LPUSH` and popped with `BRPOP`, so the list is
/// drained oldest first. Entries survive a restart of this process.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    key: String,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue").field("key", &self.key).finish()
    }
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_key(conn, TASK_QUEUE_KEY)
    }

    pub fn with_key(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of tasks waiting in the queue.
    pub async fn depth(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN").arg(&self.key).query_async(&mut conn).await?;
        Ok(len)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, spec: TaskSpec) -> Result<()> {
        let payload = serde_json::to_string(&spec)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(job_id = %spec.id(), kind = spec.kind(), queue = %self.key, "Task pushed");
        Ok(())
    }
}

/// Block up to `timeout` for the next task on `key`.
///
/// Must be called on a dedicated connection. An entry that does not decode
/// is logged and dropped so it cannot wedge the consumer.
pub async fn pop_task(
    conn: &mut MultiplexedConnection,
    key: &str,
    timeout: Duration,
) -> Result<Option<TaskSpec>> {
    let popped: Option<(String, String)> = redis::cmd("BRPOP")
        .arg(key)
        .arg(timeout.as_secs_f64())
        .query_async(conn)
        .await?;
    let Some((_, payload)) = popped else {
        return Ok(None);
    };
    match serde_json::from_str::<TaskSpec>(&payload) {
        Ok(spec) => Ok(Some(spec)),
        Err(e) => {
            tracing::warn!(queue = %key, error = %e, "Dropping undecodable queue entry");
            Ok(None)
        }
    }
}
