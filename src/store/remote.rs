use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};

use crate::error::{DockhandError, Result};
use crate::store::{Job, JobMetadata, JobState, JobStore};

const JOBS_SET_KEY: &str = "jobs:ids";

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn metadata_key(id: &str) -> String {
    format!("job:{id}:meta")
}

/// Shared Redis client, created once at start-up.
///
/// The connection manager multiplexes ordinary commands for the store and the
/// queue producer. Blocking commands (`BRPOP`) must use a
/// [`dedicated_connection`](Self::dedicated_connection) so they do not stall
/// the shared one.
#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisHandle {
    // The connection info may carry a password.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle").finish_non_exhaustive()
    }
}

impl RedisHandle {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut manager = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                DockhandError::Config(format!(
                    "timed out after {}s connecting to Redis",
                    timeout.as_secs()
                ))
            })??;

        let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
        tracing::info!(reply = %pong, "Connected to Redis");

        Ok(Self { client, manager })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn dedicated_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

// KEYS[1] job hash, KEYS[2] id set; ARGV id, state, logs json, created_at
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], 'state', ARGV[2])
  return 0
end
redis.call('HSET', KEYS[1], 'id', ARGV[1], 'state', ARGV[2], 'logs', ARGV[3], 'created_at', ARGV[4])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

// KEYS[1] job hash, KEYS[2] id set; ARGV as for CREATE_SCRIPT
const CREATE_NEW_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'id', ARGV[1], 'state', ARGV[2], 'logs', ARGV[3], 'created_at', ARGV[4])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

// KEYS[1] job hash; ARGV state
const SET_STATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[1])
return 1
"#;

// KEYS[1] job hash; ARGV line. A missing or unreadable log field starts a
// fresh list.
const APPEND_LOG_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local raw = redis.call('HGET', KEYS[1], 'logs')
local logs = {}
if raw and raw ~= '' then
  local ok, decoded = pcall(cjson.decode, raw)
  if ok and type(decoded) == 'table' then
    logs = decoded
  end
end
logs[#logs + 1] = ARGV[1]
redis.call('HSET', KEYS[1], 'logs', cjson.encode(logs))
return #logs
"#;

// KEYS[1] job hash, KEYS[2] metadata hash; ARGV flattened field/value pairs
const SET_METADATA_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('DEL', KEYS[2])
if #ARGV > 0 then
  redis.call('HSET', KEYS[2], unpack(ARGV))
end
return 1
"#;

/// Job store backed by Redis.
///
/// Each job is a hash `job:<id>` with fields `id`, `state`, `created_at` and
/// `logs` (a JSON array of strings). Known ids are kept in the set
/// `jobs:ids`. Every mutation is a server-side script, so concurrent writers
/// from several processes never lose a log line.
pub struct RedisJobStore {
    conn: ConnectionManager,
    create: Script,
    create_new: Script,
    set_state: Script,
    append_log: Script,
    set_metadata: Script,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            create: Script::new(CREATE_SCRIPT),
            create_new: Script::new(CREATE_NEW_SCRIPT),
            set_state: Script::new(SET_STATE_SCRIPT),
            append_log: Script::new(APPEND_LOG_SCRIPT),
            set_metadata: Script::new(SET_METADATA_SCRIPT),
        }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(job_from_fields(id, fields)))
    }
}

fn job_from_fields(id: &str, mut fields: HashMap<String, String>) -> Job {
    let logs = match fields.remove("logs") {
        None => Vec::new(),
        Some(raw) if raw.is_empty() => Vec::new(),
        Some(raw) => serde_json::from_str::<Vec<String>>(&raw).unwrap_or_else(|e| {
            tracing::warn!(job_id = id, error = %e, "Unreadable log field, treating as empty");
            Vec::new()
        }),
    };

    let state = fields
        .get("state")
        .and_then(|s| s.parse::<JobState>().ok())
        .unwrap_or(JobState::Queued);

    let created_at = fields
        .get("created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default();

    Job {
        id: fields.remove("id").unwrap_or_else(|| id.to_string()),
        state,
        logs,
        created_at,
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn create(&self, id: &str, state: JobState, logs: Vec<String>) -> Result<()> {
        let mut conn = self.conn.clone();
        let logs_json = serde_json::to_string(&logs)?;
        let created: i64 = self
            .create
            .key(job_key(id))
            .key(JOBS_SET_KEY)
            .arg(id)
            .arg(state.as_str())
            .arg(logs_json)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        if created == 0 {
            tracing::debug!(job_id = id, state = %state, "Job already exists, updating state only");
        }
        Ok(())
    }

    async fn create_new(&self, id: &str, state: JobState, logs: Vec<String>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let logs_json = serde_json::to_string(&logs)?;
        let created: i64 = self
            .create_new
            .key(job_key(id))
            .key(JOBS_SET_KEY)
            .arg(id)
            .arg(state.as_str())
            .arg(logs_json)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn set_state(&self, id: &str, state: JobState) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = self
            .set_state
            .key(job_key(id))
            .arg(state.as_str())
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(0) => tracing::debug!(job_id = id, state = %state, "set_state for unknown job ignored"),
            Ok(_) => {}
            Err(e) => tracing::warn!(job_id = id, state = %state, error = %e, "Failed to set job state"),
        }
    }

    async fn append_log(&self, id: &str, line: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = self
            .append_log
            .key(job_key(id))
            .arg(line)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(0) => tracing::debug!(job_id = id, "append_log for unknown job ignored"),
            Ok(_) => {}
            Err(e) => tracing::warn!(job_id = id, error = %e, "Failed to append job log"),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        self.fetch(id).await
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(JOBS_SET_KEY).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.fetch(&id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn set_metadata(&self, id: &str, metadata: &JobMetadata) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.set_metadata.key(job_key(id));
        invocation.key(metadata_key(id));
        for (field, value) in metadata {
            invocation.arg(field).arg(value);
        }
        let stored: i64 = invocation.invoke_async(&mut conn).await?;
        if stored == 0 {
            return Err(DockhandError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn metadata(&self, id: &str) -> Result<Option<JobMetadata>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(metadata_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn keys_are_namespaced_by_id() {
        assert_eq!(job_key("abc"), "job:abc");
        assert_eq!(metadata_key("abc"), "job:abc:meta");
    }

    #[test]
    fn record_without_log_field_has_empty_log() {
        let job = job_from_fields("j1", fields(&[("id", "j1"), ("state", "running")]));
        assert_eq!(job.id, "j1");
        assert_eq!(job.state, JobState::Running);
        assert!(job.logs.is_empty());
    }

    #[test]
    fn record_logs_decode_in_order() {
        let job = job_from_fields(
            "j2",
            fields(&[("state", "done"), ("logs", r#"["one","two","three"]"#)]),
        );
        assert_eq!(job.id, "j2");
        assert_eq!(job.logs, vec!["one", "two", "three"]);
    }

    #[test]
    fn unreadable_fields_fall_back() {
        let job = job_from_fields(
            "j3",
            fields(&[("state", "bogus"), ("logs", "not json"), ("created_at", "x")]),
        );
        assert_eq!(job.state, JobState::Queued);
        assert!(job.logs.is_empty());
        assert_eq!(job.created_at, DateTime::<Utc>::default());
    }
}
