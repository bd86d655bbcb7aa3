//! The analysis pipeline: drives a report through
//! `pending → processing → completed | failed` in the background.
//!
//! Upload handlers return as soon as the report record exists; the actual
//! model call runs as a [`job_flow`] job keyed by the report id. The status
//! flip to `processing` is persisted *before* the external call, so a crash
//! mid-call leaves the record visibly in flight rather than silently
//! `pending`. Report fields are made durable before the chat side effect is
//! attempted; the chat note is best-effort and never rolls the analysis
//! back.

use std::sync::Arc;

use async_trait::async_trait;
use job_flow::{Job, JobError, JobHandle, JobQueue};
use tracing::{error, info};

use crate::ai::AnalysisClient;
use crate::models::{MessageRole, MessageType, Report};
use crate::store::{ChatStore, ReportStore};

pub struct AnalysisPipeline {
    reports: Arc<dyn ReportStore>,
    chats: Arc<dyn ChatStore>,
    client: Arc<dyn AnalysisClient>,
    queue: JobQueue,
}

impl AnalysisPipeline {
    pub fn new(
        reports: Arc<dyn ReportStore>,
        chats: Arc<dyn ChatStore>,
        client: Arc<dyn AnalysisClient>,
        queue: JobQueue,
    ) -> Self {
        Self {
            reports,
            chats,
            client,
            queue,
        }
    }

    /// Submit background analysis for a report.
    ///
    /// Fails with [`JobError::AlreadyRunning`] when an analysis job for
    /// this report is still live, which is the backstop against a retry
    /// request racing an in-flight run.
    pub fn start(&self, report: &Report) -> job_flow::Result<JobHandle> {
        info!("Queueing analysis for report {}", report.id);
        self.queue.submit(Arc::new(AnalysisJob {
            report_id: report.id.clone(),
            user_id: report.user_id.clone(),
            file_url: report.file_url.clone(),
            file_type: report.file_type.clone(),
            original_name: report.original_name.clone(),
            reports: Arc::clone(&self.reports),
            chats: Arc::clone(&self.chats),
            client: Arc::clone(&self.client),
        }))
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

struct AnalysisJob {
    report_id: String,
    user_id: String,
    file_url: String,
    file_type: String,
    original_name: String,
    reports: Arc<dyn ReportStore>,
    chats: Arc<dyn ChatStore>,
    client: Arc<dyn AnalysisClient>,
}

#[async_trait]
impl Job for AnalysisJob {
    fn id(&self) -> &str {
        &self.report_id
    }

    async fn run(&self) -> job_flow::Result<()> {
        let started = self
            .reports
            .begin_processing(&self.report_id)
            .await
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;
        if !started {
            info!(
                "Report {} is already being analyzed, skipping",
                self.report_id
            );
            return Ok(());
        }

        match self.client.analyze(&self.file_url, &self.file_type).await {
            Ok(analyzed) => {
                let english = analyzed.summary.english.clone();
                self.reports
                    .complete_analysis(&self.report_id, analyzed.summary)
                    .await
                    .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;
                info!("Analysis of report {} completed", self.report_id);

                // The analysis result is already durable; the chat note is
                // best-effort and a failure here is only logged.
                let note = format!(
                    "New medical report analyzed: {}\n\n{}",
                    self.original_name, english
                );
                if let Err(e) = self
                    .chats
                    .add_message(
                        &self.user_id,
                        MessageRole::Assistant,
                        &note,
                        Some(&self.report_id),
                        MessageType::ReportAnalysis,
                    )
                    .await
                {
                    error!(
                        "Failed to append analysis note to chat of user {}: {}",
                        self.user_id, e
                    );
                }
                Ok(())
            }
            Err(analysis_error) => {
                error!(
                    "Analysis of report {} failed: {}",
                    self.report_id, analysis_error
                );
                self.reports
                    .fail_analysis(&self.report_id, &analysis_error.to_string())
                    .await
                    .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;
                Err(JobError::ExecutionFailed(analysis_error.to_string()))
            }
        }
    }

    async fn on_timeout(&self) {
        if let Err(e) = self
            .reports
            .fail_analysis(&self.report_id, "Analysis timed out")
            .await
        {
            error!(
                "Failed to record timeout for report {}: {}",
                self.report_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AnalyzedReport;
    use crate::models::{AiSummary, AnalysisStatus, ChatMessage};
    use crate::store::{
        InMemoryChatStore, InMemoryReportStore, StoreError, StoreResult,
    };
    use std::time::Duration;

    enum Script {
        Succeed,
        Fail,
        Hang,
    }

    struct ScriptedClient {
        script: Script,
    }

    #[async_trait]
    impl AnalysisClient for ScriptedClient {
        async fn analyze(
            &self,
            _file_location: &str,
            _mime_hint: &str,
        ) -> anyhow::Result<AnalyzedReport> {
            match self.script {
                Script::Succeed => Ok(AnalyzedReport {
                    summary: AiSummary {
                        english: "All values are within range.".to_string(),
                        roman_urdu: "Sab theek hai.".to_string(),
                        ..AiSummary::default()
                    },
                    raw_response: "**English Summary**: ...".to_string(),
                }),
                Script::Fail => Err(anyhow::anyhow!("model unavailable")),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!("hung analysis should have been cut off")
                }
            }
        }

        async fn chat(&self, _user_message: &str, _context: &str) -> anyhow::Result<String> {
            Ok("reply".to_string())
        }
    }

    /// Chat store whose appends always fail, for the best-effort check.
    struct BrokenChatStore;

    #[async_trait]
    impl ChatStore for BrokenChatStore {
        async fn get_or_create(&self, _user_id: &str) -> StoreResult<crate::models::Chat> {
            Err(StoreError::Backend("chat store down".to_string()))
        }

        async fn add_message(
            &self,
            _user_id: &str,
            _role: MessageRole,
            _content: &str,
            _report_id: Option<&str>,
            _message_type: MessageType,
        ) -> StoreResult<ChatMessage> {
            Err(StoreError::Backend("chat store down".to_string()))
        }

        async fn recent_messages(
            &self,
            _user_id: &str,
            _limit: usize,
        ) -> StoreResult<Vec<ChatMessage>> {
            Ok(Vec::new())
        }

        async fn history(
            &self,
            _user_id: &str,
            _limit: usize,
            _offset: usize,
        ) -> StoreResult<crate::store::ChatHistoryPage> {
            Err(StoreError::Backend("chat store down".to_string()))
        }

        async fn clear_history(&self, _user_id: &str) -> StoreResult<bool> {
            Ok(false)
        }

        async fn stats(&self, _user_id: &str) -> StoreResult<crate::models::ChatStats> {
            Err(StoreError::Backend("chat store down".to_string()))
        }

        async fn search(
            &self,
            _user_id: &str,
            _query: &str,
            _limit: usize,
        ) -> StoreResult<Vec<ChatMessage>> {
            Ok(Vec::new())
        }
    }

    fn pipeline_with(
        script: Script,
        queue: JobQueue,
    ) -> (AnalysisPipeline, Arc<InMemoryReportStore>, Arc<InMemoryChatStore>) {
        let reports = Arc::new(InMemoryReportStore::new());
        let chats = Arc::new(InMemoryChatStore::new());
        let pipeline = AnalysisPipeline::new(
            reports.clone(),
            chats.clone(),
            Arc::new(ScriptedClient { script }),
            queue,
        );
        (pipeline, reports, chats)
    }

    async fn seeded_report(reports: &InMemoryReportStore) -> Report {
        reports
            .create(Report::new(
                "user-1",
                "stored_cbc.pdf",
                "cbc.pdf",
                "/tmp/stored_cbc.pdf",
                "application/pdf",
                1024,
                None,
                vec![],
                String::new(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_analysis_completes_and_notes_the_chat() {
        let (pipeline, reports, chats) = pipeline_with(Script::Succeed, JobQueue::new());
        let report = seeded_report(&reports).await;
        assert_eq!(report.analysis_status, AnalysisStatus::Pending);

        pipeline.start(&report).unwrap().join().await;

        let loaded = reports.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Completed);
        assert_eq!(loaded.ai_summary.english, "All values are within range.");
        assert!(loaded.analysis_error.is_none());

        let messages = chats.recent_messages("user-1", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[0].message_type, MessageType::ReportAnalysis);
        assert!(messages[0].content.contains("cbc.pdf"));
        assert!(messages[0].content.contains("All values are within range."));
        assert_eq!(messages[0].report_id.as_deref(), Some(report.id.as_str()));
    }

    #[tokio::test]
    async fn failed_analysis_records_the_error_without_a_chat_note() {
        let (pipeline, reports, chats) = pipeline_with(Script::Fail, JobQueue::new());
        let report = seeded_report(&reports).await;

        pipeline.start(&report).unwrap().join().await;

        let loaded = reports.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Failed);
        assert!(
            loaded
                .analysis_error
                .as_deref()
                .unwrap()
                .contains("model unavailable")
        );
        assert!(chats.recent_messages("user-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_never_stays_pending_once_started() {
        let (pipeline, reports, _) = pipeline_with(Script::Fail, JobQueue::new());
        let report = seeded_report(&reports).await;

        pipeline.start(&report).unwrap().join().await;

        let loaded = reports.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_ne!(loaded.analysis_status, AnalysisStatus::Pending);
        assert_ne!(loaded.analysis_status, AnalysisStatus::Processing);
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected_while_running() {
        let (pipeline, reports, _) = pipeline_with(Script::Hang, JobQueue::new());
        let report = seeded_report(&reports).await;

        let _running = pipeline.start(&report).unwrap();
        tokio::task::yield_now().await;

        let duplicate = pipeline.start(&report);
        assert!(matches!(duplicate, Err(JobError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn hung_analysis_is_demoted_to_failed() {
        let queue = JobQueue::with_timeout(Duration::from_millis(20));
        let (pipeline, reports, _) = pipeline_with(Script::Hang, queue);
        let report = seeded_report(&reports).await;

        pipeline.start(&report).unwrap().join().await;

        let loaded = reports.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Failed);
        assert_eq!(loaded.analysis_error.as_deref(), Some("Analysis timed out"));
        assert_eq!(
            pipeline.queue().state(&report.id),
            Some(job_flow::JobState::TimedOut)
        );
    }

    #[tokio::test]
    async fn chat_append_failure_does_not_roll_back_completion() {
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = AnalysisPipeline::new(
            reports.clone(),
            Arc::new(BrokenChatStore),
            Arc::new(ScriptedClient {
                script: Script::Succeed,
            }),
            JobQueue::new(),
        );
        let report = seeded_report(&reports).await;

        pipeline.start(&report).unwrap().join().await;

        let loaded = reports.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Completed);
        assert_eq!(
            pipeline.queue().state(&report.id),
            Some(job_flow::JobState::Completed)
        );
    }

    #[tokio::test]
    async fn failed_report_can_be_retried_after_reset() {
        let (pipeline, reports, _) = pipeline_with(Script::Succeed, JobQueue::new());
        let report = seeded_report(&reports).await;
        reports.fail_analysis(&report.id, "first attempt failed").await.unwrap();

        reports.reset_for_retry(&report.id).await.unwrap();
        pipeline.start(&report).unwrap().join().await;

        let loaded = reports.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Completed);
        assert!(loaded.analysis_error.is_none());
    }
}
