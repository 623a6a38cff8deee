use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::{Job, JobMetadata, JobState, JobStore};

#[derive(Debug)]
struct JobRecord {
    job: Job,
    metadata: Option<JobMetadata>,
}

/// Process-local job store. Every operation holds one mutex, which is
/// sufficient for a single-process deployment.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, id: &str, state: JobState, logs: Vec<String>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.get_mut(id) {
            tracing::debug!(job_id = id, state = %state, "Job already exists, updating state only");
            existing.job.state = state;
            return Ok(());
        }
        jobs.insert(
            id.to_string(),
            JobRecord {
                job: Job::with_state(id, state, logs),
                metadata: None,
            },
        );
        Ok(())
    }

    async fn create_new(&self, id: &str, state: JobState, logs: Vec<String>) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(id) {
            return Ok(false);
        }
        jobs.insert(
            id.to_string(),
            JobRecord {
                job: Job::with_state(id, state, logs),
                metadata: None,
            },
        );
        Ok(true)
    }

    async fn set_state(&self, id: &str, state: JobState) {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(record) => record.job.state = state,
            None => tracing::debug!(job_id = id, state = %state, "set_state for unknown job ignored"),
        }
    }

    async fn append_log(&self, id: &str, line: &str) {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(record) => record.job.logs.push(line.to_string()),
            None => tracing::debug!(job_id = id, "append_log for unknown job ignored"),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(id).map(|record| record.job.clone()))
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut all: Vec<Job> = jobs.values().map(|record| record.job.clone()).collect();
        all.sort_by_key(|job| job.created_at);
        Ok(all)
    }

    async fn set_metadata(&self, id: &str, metadata: &JobMetadata) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(record) => {
                record.metadata = Some(metadata.clone());
                Ok(())
            }
            None => Err(crate::error::DockhandError::JobNotFound(id.to_string())),
        }
    }

    async fn metadata(&self, id: &str) -> Result<Option<JobMetadata>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(id).and_then(|record| record.metadata.clone()))
    }
}
