use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// A unit of background work executed by a [`crate::JobQueue`].
#[async_trait]
pub trait Job: Send + Sync {
    /// Identifier for this job. Submitting another job with the same id
    /// while the first has not reached a terminal state is rejected.
    fn id(&self) -> &str;

    /// Execute the job to completion.
    async fn run(&self) -> Result<()>;

    /// Called by the queue when `run` was cut off by the configured
    /// timeout. Jobs that persist externally visible state use this to
    /// record the abort; the default does nothing.
    async fn on_timeout(&self) {}
}

/// Lifecycle state of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed { error: String },
    TimedOut,
}

impl JobState {
    /// Queued and running jobs are live; everything else is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

/// Snapshot of a job's progress through the queue.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn queued(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
