pub mod error;
pub mod job;
pub mod queue;

// Re-export commonly used types
pub use error::{JobError, Result};
pub use job::{Job, JobRecord, JobState};
pub use queue::{JobHandle, JobQueue};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJob {
        id: String,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        fn id(&self) -> &str {
            "failing"
        }

        async fn run(&self) -> Result<()> {
            Err(JobError::ExecutionFailed("boom".to_string()))
        }
    }

    struct SlowJob {
        timed_out: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for SlowJob {
        fn id(&self) -> &str {
            "slow"
        }

        async fn run(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn on_timeout(&self) {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_job_completes_and_is_recorded() {
        let queue = JobQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let handle = queue
            .submit(Arc::new(CountingJob {
                id: "job1".to_string(),
                runs: runs.clone(),
            }))
            .unwrap();
        handle.join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.state("job1"), Some(JobState::Completed));
        assert!(!queue.is_live("job1"));

        let record = queue.record("job1").unwrap();
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_is_captured() {
        let queue = JobQueue::new();

        let handle = queue.submit(Arc::new(FailingJob)).unwrap();
        handle.join().await;

        match queue.state("failing") {
            Some(JobState::Failed { error }) => assert!(error.contains("boom")),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_demotes_job_and_fires_hook() {
        let queue = JobQueue::with_timeout(Duration::from_millis(20));
        let timed_out = Arc::new(AtomicUsize::new(0));

        let handle = queue
            .submit(Arc::new(SlowJob {
                timed_out: timed_out.clone(),
            }))
            .unwrap();
        handle.join().await;

        assert_eq!(queue.state("slow"), Some(JobState::TimedOut));
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_live_duplicate_is_rejected_but_retry_after_finish_works() {
        let queue = JobQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));

        struct BlockedJob {
            release: tokio::sync::Semaphore,
        }

        // Hold a job in the running state with a semaphore it never acquires
        // until we add a permit.
        let blocked = Arc::new(BlockedJob {
            release: tokio::sync::Semaphore::new(0),
        });

        #[async_trait]
        impl Job for BlockedJob {
            fn id(&self) -> &str {
                "dup"
            }

            async fn run(&self) -> Result<()> {
                let _permit = self.release.acquire().await;
                Ok(())
            }
        }

        let first = queue.submit(blocked.clone()).unwrap();
        // Give the task a chance to reach running.
        tokio::task::yield_now().await;

        let second = queue.submit(Arc::new(CountingJob {
            id: "dup".to_string(),
            runs: runs.clone(),
        }));
        assert!(matches!(second, Err(JobError::AlreadyRunning(_))));

        blocked.release.add_permits(1);
        first.join().await;
        assert_eq!(queue.state("dup"), Some(JobState::Completed));

        // After the first run finished, the id can be reused.
        let retry = queue
            .submit(Arc::new(CountingJob {
                id: "dup".to_string(),
                runs: runs.clone(),
            }))
            .unwrap();
        retry.join().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
