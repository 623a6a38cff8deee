use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DockhandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

impl JobState {
    /// `done` and `error` admit no further automatic transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DockhandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "error" => Ok(JobState::Error),
            other => Err(DockhandError::Internal(format!("unknown job state: {other}"))),
        }
    }
}

/// Point-in-time snapshot of a job. Owned by the caller; mutating it has no
/// effect on the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_state(id, JobState::Queued, Vec::new())
    }

    pub fn with_state(id: impl Into<String>, state: JobState, logs: Vec<String>) -> Self {
        Self {
            id: id.into(),
            state,
            logs,
            created_at: Utc::now(),
        }
    }
}

/// Inputs remembered alongside a job so it can be re-submitted later.
pub type JobMetadata = HashMap<String, String>;
