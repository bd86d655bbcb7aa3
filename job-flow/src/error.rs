use thiserror::Error;

/// Errors surfaced by job execution and queue operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job body returned an error.
    #[error("job execution failed: {0}")]
    ExecutionFailed(String),

    /// The job exceeded the queue's configured timeout.
    #[error("job timed out after {0} seconds")]
    TimedOut(u64),

    /// A job with the same id was submitted while the previous one is
    /// still queued or running.
    #[error("job already running: {0}")]
    AlreadyRunning(String),

    /// No record exists for the given job id.
    #[error("job not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, JobError>;
