//! JobQueue – submits jobs onto the Tokio runtime and tracks their
//! lifecycle in a shared map.
//!
//! The queue exists so that background work is *inspectable*: instead of an
//! unawaited future whose failure is at best a log line, every submission
//! leaves a [`JobRecord`] behind that callers can query for queued, running
//! and finished state. The queue also closes two classic gaps of the
//! fire-and-forget pattern:
//!
//! * **Duplicate triggers** – submitting a job id that is still live is
//!   rejected with [`JobError::AlreadyRunning`], so a retry racing an
//!   in-flight run cannot start a second one.
//! * **Hung jobs** – an optional per-job timeout drops the run future and
//!   records [`JobState::TimedOut`]; the job's `on_timeout` hook lets it
//!   persist the abort wherever its state is externally visible.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    error::{JobError, Result},
    job::{Job, JobRecord, JobState},
};

/// In-process job queue backed by the Tokio runtime.
#[derive(Clone, Default)]
pub struct JobQueue {
    records: Arc<DashMap<String, JobRecord>>,
    timeout: Option<Duration>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that cuts every job off after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            timeout: Some(timeout),
        }
    }

    /// Submit a job for background execution and return immediately.
    ///
    /// A terminal record (completed/failed/timed out) under the same id is
    /// replaced, which is what makes explicit retries possible. A live
    /// record is not.
    pub fn submit(&self, job: Arc<dyn Job>) -> Result<JobHandle> {
        let id = job.id().to_string();

        // Entry-based check-and-insert: two concurrent submits of the same
        // id cannot both pass the guard.
        match self.records.entry(id.clone()) {
            Entry::Occupied(occupied) if !occupied.get().state.is_terminal() => {
                warn!("rejecting duplicate submission of live job {}", id);
                return Err(JobError::AlreadyRunning(id));
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(JobRecord::queued(&id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(JobRecord::queued(&id));
            }
        }

        let records = Arc::clone(&self.records);
        let timeout = self.timeout;
        let job_id = id.clone();

        let handle = tokio::spawn(async move {
            mark_started(&records, &job_id);

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, job.run()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("job {} exceeded timeout of {:?}", job_id, limit);
                        job.on_timeout().await;
                        Err(JobError::TimedOut(limit.as_secs()))
                    }
                },
                None => job.run().await,
            };

            let state = match outcome {
                Ok(()) => {
                    info!("job {} completed", job_id);
                    JobState::Completed
                }
                Err(JobError::TimedOut(_)) => JobState::TimedOut,
                Err(e) => {
                    error!("job {} failed: {}", job_id, e);
                    JobState::Failed {
                        error: e.to_string(),
                    }
                }
            };
            mark_finished(&records, &job_id, state);
        });

        Ok(JobHandle { id, handle })
    }

    /// Snapshot of a single job's record.
    pub fn record(&self, id: &str) -> Option<JobRecord> {
        self.records.get(id).map(|entry| entry.clone())
    }

    /// Current state of a job, if one was ever submitted.
    pub fn state(&self, id: &str) -> Option<JobState> {
        self.records.get(id).map(|entry| entry.state.clone())
    }

    /// Whether the job is queued or running right now.
    pub fn is_live(&self, id: &str) -> bool {
        self.records
            .get(id)
            .map(|entry| !entry.state.is_terminal())
            .unwrap_or(false)
    }

    /// Records of every job this queue has seen, in no particular order.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.records.iter().map(|entry| entry.clone()).collect()
    }
}

fn mark_started(records: &DashMap<String, JobRecord>, id: &str) {
    if let Some(mut record) = records.get_mut(id) {
        record.state = JobState::Running;
        record.started_at = Some(Utc::now());
    }
}

fn mark_finished(records: &DashMap<String, JobRecord>, id: &str, state: JobState) {
    if let Some(mut record) = records.get_mut(id) {
        record.state = state;
        record.finished_at = Some(Utc::now());
    }
}

/// Handle to a submitted job. Dropping it does not cancel the job; `join`
/// is mostly useful in tests and shutdown paths.
pub struct JobHandle {
    id: String,
    handle: JoinHandle<()>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the background task to finish.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
