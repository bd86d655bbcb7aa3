//! DashMap-backed stores. The default backend, and what the test suite
//! runs against.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{
    ChatHistoryPage, ChatStore, ReportPage, ReportStore, StoreError, StoreResult, UserStore,
    build_timeline, filter_and_page, history_window, recent_window, search_window, stats_of,
};
use crate::models::{
    AiSummary, AnalysisStatus, Chat, ChatMessage, ChatStats, ListReportsQuery, MessageRole,
    MessageType, Report, TimelineQuery, UpdateReportRequest, User,
};

#[derive(Default)]
pub struct InMemoryReportStore {
    reports: DashMap<String, Report>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_reports(&self, user_id: &str) -> Vec<Report> {
        self.reports
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn create(&self, report: Report) -> StoreResult<Report> {
        self.reports.insert(report.id.clone(), report.clone());
        Ok(report)
    }

    async fn get(&self, id: &str, user_id: &str) -> StoreResult<Option<Report>> {
        Ok(self
            .reports
            .get(id)
            .filter(|report| report.user_id == user_id)
            .map(|report| report.clone()))
    }

    async fn list(&self, user_id: &str, query: &ListReportsQuery) -> StoreResult<ReportPage> {
        Ok(filter_and_page(self.user_reports(user_id), query))
    }

    async fn update_metadata(
        &self,
        id: &str,
        user_id: &str,
        patch: &UpdateReportRequest,
    ) -> StoreResult<Option<Report>> {
        let Some(mut report) = self.reports.get_mut(id) else {
            return Ok(None);
        };
        if report.user_id != user_id {
            return Ok(None);
        }

        if let Some(tags) = &patch.tags {
            report.tags = tags.clone();
        }
        if let Some(notes) = &patch.notes {
            report.notes = notes.clone();
        }
        if let Some(is_important) = patch.is_important {
            report.is_important = is_important;
        }
        report.updated_at = Utc::now();

        Ok(Some(report.clone()))
    }

    async fn delete(&self, id: &str, user_id: &str) -> StoreResult<Option<Report>> {
        let owned = self
            .reports
            .get(id)
            .map(|report| report.user_id == user_id)
            .unwrap_or(false);
        if !owned {
            return Ok(None);
        }
        Ok(self.reports.remove(id).map(|(_, report)| report))
    }

    async fn timeline(
        &self,
        user_id: &str,
        query: &TimelineQuery,
    ) -> StoreResult<BTreeMap<String, Vec<Report>>> {
        Ok(build_timeline(self.user_reports(user_id), query))
    }

    async fn recent_completed(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Report>> {
        let mut completed: Vec<Report> = self
            .user_reports(user_id)
            .into_iter()
            .filter(|report| {
                report.analysis_status == AnalysisStatus::Completed
                    && !report.ai_summary.english.is_empty()
            })
            .collect();
        completed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        completed.truncate(limit);
        Ok(completed)
    }

    async fn begin_processing(&self, id: &str) -> StoreResult<bool> {
        let mut report = self.reports.get_mut(id).ok_or(StoreError::NotFound)?;
        match report.analysis_status {
            AnalysisStatus::Pending | AnalysisStatus::Failed => {
                report.analysis_status = AnalysisStatus::Processing;
                report.analysis_error = None;
                report.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_analysis(&self, id: &str, summary: AiSummary) -> StoreResult<()> {
        let mut report = self.reports.get_mut(id).ok_or(StoreError::NotFound)?;
        report.analysis_status = AnalysisStatus::Completed;
        report.analysis_error = None;
        report.ai_summary = summary;
        report.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_analysis(&self, id: &str, error: &str) -> StoreResult<()> {
        let mut report = self.reports.get_mut(id).ok_or(StoreError::NotFound)?;
        report.analysis_status = AnalysisStatus::Failed;
        report.analysis_error = Some(error.to_string());
        report.ai_summary = AiSummary::default();
        report.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_for_retry(&self, id: &str) -> StoreResult<()> {
        let mut report = self.reports.get_mut(id).ok_or(StoreError::NotFound)?;
        report.analysis_status = AnalysisStatus::Pending;
        report.analysis_error = None;
        report.ai_summary = AiSummary::default();
        report.updated_at = Utc::now();
        Ok(())
    }
}

/// Chats are keyed by owner: exactly one per user.
#[derive(Default)]
pub struct InMemoryChatStore {
    chats: DashMap<String, Chat>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_or_create(&self, user_id: &str) -> StoreResult<Chat> {
        let chat = self
            .chats
            .entry(user_id.to_string())
            .or_insert_with(|| Chat::new(user_id))
            .clone();
        Ok(chat)
    }

    async fn add_message(
        &self,
        user_id: &str,
        role: MessageRole,
        content: &str,
        report_id: Option<&str>,
        message_type: MessageType,
    ) -> StoreResult<ChatMessage> {
        let message =
            ChatMessage::new(role, content, report_id.map(str::to_string), message_type);
        let mut chat = self
            .chats
            .entry(user_id.to_string())
            .or_insert_with(|| Chat::new(user_id));
        chat.messages.push(message.clone());
        chat.last_activity = Utc::now();
        Ok(message)
    }

    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .chats
            .get(user_id)
            .map(|chat| recent_window(&chat.messages, limit))
            .unwrap_or_default())
    }

    async fn history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<ChatHistoryPage> {
        Ok(self
            .chats
            .get(user_id)
            .map(|chat| history_window(&chat.messages, limit, offset))
            .unwrap_or(ChatHistoryPage {
                messages: Vec::new(),
                total_messages: 0,
                has_more: false,
            }))
    }

    async fn clear_history(&self, user_id: &str) -> StoreResult<bool> {
        let Some(mut chat) = self.chats.get_mut(user_id) else {
            return Ok(false);
        };
        chat.messages.clear();
        chat.last_activity = Utc::now();
        Ok(true)
    }

    async fn stats(&self, user_id: &str) -> StoreResult<ChatStats> {
        Ok(stats_of(self.chats.get(user_id).as_deref()))
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .chats
            .get(user_id)
            .map(|chat| search_window(&chat.messages, query, limit))
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<String, User>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn create(&self, user: User) -> StoreResult<User> {
        let email_lower = user.email.to_lowercase();
        let taken = self
            .users
            .iter()
            .any(|existing| existing.email.to_lowercase() == email_lower);
        if taken {
            return Err(StoreError::DuplicateEmail);
        }
        self.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.get(id).map(|user| user.clone()))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email_lower = email.to_lowercase();
        Ok(self
            .users
            .iter()
            .find(|user| user.email.to_lowercase() == email_lower)
            .map(|user| user.clone()))
    }

    async fn update_name(&self, id: &str, name: &str) -> StoreResult<Option<User>> {
        let Some(mut user) = self.users.get_mut(id) else {
            return Ok(None);
        };
        user.name = name.to_string();
        Ok(Some(user.clone()))
    }

    async fn update_password(&self, id: &str, password_hash: &str) -> StoreResult<Option<User>> {
        let Some(mut user) = self.users.get_mut(id) else {
            return Ok(None);
        };
        user.password_hash = password_hash.to_string();
        Ok(Some(user.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_report(user_id: &str) -> Report {
        Report::new(
            user_id,
            "stored_cbc.pdf",
            "cbc.pdf",
            "/tmp/stored_cbc.pdf",
            "application/pdf",
            1024,
            Some("blob-1".to_string()),
            vec![],
            String::new(),
        )
    }

    #[tokio::test]
    async fn begin_processing_is_a_conditional_transition() {
        let store = InMemoryReportStore::new();
        let report = store.create(seeded_report("user-1")).await.unwrap();

        assert!(store.begin_processing(&report.id).await.unwrap());
        // A second attempt while processing is refused.
        assert!(!store.begin_processing(&report.id).await.unwrap());

        store.fail_analysis(&report.id, "model unavailable").await.unwrap();
        // Failed reports may re-enter the pipeline.
        assert!(store.begin_processing(&report.id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_analysis_clears_summary_and_sets_error() {
        let store = InMemoryReportStore::new();
        let report = store.create(seeded_report("user-1")).await.unwrap();

        store.begin_processing(&report.id).await.unwrap();
        store
            .complete_analysis(
                &report.id,
                AiSummary {
                    english: "ok".to_string(),
                    ..AiSummary::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Completed);
        assert_eq!(loaded.ai_summary.english, "ok");
        assert!(loaded.analysis_error.is_none());

        store.fail_analysis(&report.id, "boom").await.unwrap();
        let loaded = store.get(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(loaded.analysis_status, AnalysisStatus::Failed);
        assert_eq!(loaded.analysis_error.as_deref(), Some("boom"));
        assert!(loaded.ai_summary.is_empty());
    }

    #[tokio::test]
    async fn reports_are_scoped_to_their_owner() {
        let store = InMemoryReportStore::new();
        let report = store.create(seeded_report("user-1")).await.unwrap();

        assert!(store.get(&report.id, "user-2").await.unwrap().is_none());
        assert!(store.delete(&report.id, "user-2").await.unwrap().is_none());
        assert!(store.get(&report.id, "user-1").await.unwrap().is_some());

        let deleted = store.delete(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(deleted.storage_id.as_deref(), Some("blob-1"));
        assert!(store.get(&report.id, "user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chat_is_created_lazily_and_messages_accumulate() {
        let store = InMemoryChatStore::new();

        let chat = store.get_or_create("user-1").await.unwrap();
        assert!(chat.messages.is_empty());
        assert!(chat.is_active);

        store
            .add_message("user-1", MessageRole::User, "hello", None, MessageType::Text)
            .await
            .unwrap();
        store
            .add_message(
                "user-1",
                MessageRole::Assistant,
                "hi there",
                Some("report-1"),
                MessageType::ReportAnalysis,
            )
            .await
            .unwrap();

        let recent = store.recent_messages("user-1", 50).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "hello");
        assert_eq!(recent[1].report_id.as_deref(), Some("report-1"));

        let stats = store.stats("user-1").await.unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.user_messages, 1);
        assert_eq!(stats.ai_messages, 1);
    }

    #[tokio::test]
    async fn clear_history_requires_an_existing_chat() {
        let store = InMemoryChatStore::new();
        assert!(!store.clear_history("user-1").await.unwrap());

        store
            .add_message("user-1", MessageRole::User, "hello", None, MessageType::Text)
            .await
            .unwrap();
        assert!(store.clear_history("user-1").await.unwrap());
        assert!(store.recent_messages("user-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = InMemoryUserStore::new();
        store
            .create(User::new("Amna", "amna@example.com", "salt$digest"))
            .await
            .unwrap();

        let duplicate = store
            .create(User::new("Other", "AMNA@example.com", "salt$digest"))
            .await;
        assert!(matches!(duplicate, Err(StoreError::DuplicateEmail)));
    }
}
