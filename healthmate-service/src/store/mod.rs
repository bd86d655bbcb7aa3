//! Persistence traits and the pure query logic shared by every backend.
//!
//! Aggregates are read and written whole through stateless store
//! operations; nothing hands out a live document to mutate in place. The
//! in-memory backend is always available; a Postgres backend sits behind
//! the `postgres` cargo feature.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Datelike;
use regex::RegexBuilder;
use thiserror::Error;

use crate::models::{
    AiSummary, AnalysisStatus, Chat, ChatMessage, ChatStats, ListReportsQuery, MessageRole,
    MessageType, Pagination, Report, TimelineQuery, UpdateReportRequest, User,
};

pub use memory::{InMemoryChatStore, InMemoryReportStore, InMemoryUserStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("email already registered")]
    DuplicateEmail,
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One page of a user's report collection.
#[derive(Debug, Clone)]
pub struct ReportPage {
    pub reports: Vec<Report>,
    pub pagination: Pagination,
}

/// One window of a user's chat history, counted from the newest message.
#[derive(Debug, Clone)]
pub struct ChatHistoryPage {
    pub messages: Vec<ChatMessage>,
    pub total_messages: usize,
    pub has_more: bool,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn create(&self, report: Report) -> StoreResult<Report>;

    /// Fetch a report scoped to its owner.
    async fn get(&self, id: &str, user_id: &str) -> StoreResult<Option<Report>>;

    async fn list(&self, user_id: &str, query: &ListReportsQuery) -> StoreResult<ReportPage>;

    /// Apply a partial update of the user-editable metadata.
    async fn update_metadata(
        &self,
        id: &str,
        user_id: &str,
        patch: &UpdateReportRequest,
    ) -> StoreResult<Option<Report>>;

    /// Remove the report, returning the deleted record so the caller can
    /// release the stored file.
    async fn delete(&self, id: &str, user_id: &str) -> StoreResult<Option<Report>>;

    /// Reports grouped by `YYYY-MM-DD` creation date, newest day first
    /// inside each group, optionally restricted to one calendar month.
    async fn timeline(
        &self,
        user_id: &str,
        query: &TimelineQuery,
    ) -> StoreResult<BTreeMap<String, Vec<Report>>>;

    /// The newest analyzed reports, used as chat context.
    async fn recent_completed(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Report>>;

    /// Conditionally transition `pending|failed → processing`.
    ///
    /// Returns `false` without touching the record when the report is
    /// already `processing` (or `completed`), which is what stops a retry
    /// racing an in-flight analysis from double-running it.
    async fn begin_processing(&self, id: &str) -> StoreResult<bool>;

    /// Transition `processing → completed` and persist the summary.
    async fn complete_analysis(&self, id: &str, summary: AiSummary) -> StoreResult<()>;

    /// Transition to `failed` and persist the error message.
    async fn fail_analysis(&self, id: &str, error: &str) -> StoreResult<()>;

    /// Reset a non-processing report to `pending` and clear the previous
    /// outcome, ahead of a retry.
    async fn reset_for_retry(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// The per-user chat, created lazily on first access.
    async fn get_or_create(&self, user_id: &str) -> StoreResult<Chat>;

    /// Append a message and bump `last_activity`. Creates the chat if the
    /// user has none yet.
    async fn add_message(
        &self,
        user_id: &str,
        role: MessageRole,
        content: &str,
        report_id: Option<&str>,
        message_type: MessageType,
    ) -> StoreResult<ChatMessage>;

    /// The last `limit` messages in chronological order (oldest first).
    async fn recent_messages(&self, user_id: &str, limit: usize)
    -> StoreResult<Vec<ChatMessage>>;

    async fn history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<ChatHistoryPage>;

    /// Empty the message log. Returns `false` when the user has no chat.
    async fn clear_history(&self, user_id: &str) -> StoreResult<bool>;

    async fn stats(&self, user_id: &str) -> StoreResult<ChatStats>;

    /// Case-insensitive content search, newest first.
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user; fails with [`StoreError::DuplicateEmail`] when
    /// the email is taken.
    async fn create(&self, user: User) -> StoreResult<User>;

    async fn get(&self, id: &str) -> StoreResult<Option<User>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn update_name(&self, id: &str, name: &str) -> StoreResult<Option<User>>;

    async fn update_password(&self, id: &str, password_hash: &str) -> StoreResult<Option<User>>;
}

// ---------------------------------------------------------------------------
// Pure query logic, shared by every backend so they stay behaviorally
// identical.
// ---------------------------------------------------------------------------

pub(crate) fn filter_and_page(mut reports: Vec<Report>, query: &ListReportsQuery) -> ReportPage {
    if let Some(status) = query.status {
        reports.retain(|report| report.analysis_status == status);
    }
    if let Some(search) = query.search.as_deref() {
        let needle = search.to_lowercase();
        if !needle.is_empty() {
            reports.retain(|report| matches_search(report, &needle));
        }
    }

    sort_reports(
        &mut reports,
        query.sort_by.as_deref().unwrap_or("createdAt"),
        query.sort_order.as_deref() != Some("asc"),
    );

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).max(1);
    let total = reports.len() as u64;
    let total_pages = total.div_ceil(limit);

    let reports: Vec<Report> = reports
        .into_iter()
        .skip(((page - 1) * limit) as usize)
        .take(limit as usize)
        .collect();

    ReportPage {
        reports,
        pagination: Pagination {
            current_page: page,
            total_pages,
            total_reports: total,
            has_next: page < total_pages,
            has_prev: page > 1,
        },
    }
}

fn matches_search(report: &Report, needle_lower: &str) -> bool {
    report.original_name.to_lowercase().contains(needle_lower)
        || report.notes.to_lowercase().contains(needle_lower)
        || report
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(needle_lower))
}

fn sort_reports(reports: &mut [Report], sort_by: &str, descending: bool) {
    reports.sort_by(|a, b| {
        let ordering = match sort_by {
            "originalName" => a.original_name.cmp(&b.original_name),
            "fileName" => a.file_name.cmp(&b.file_name),
            "fileSize" => a.file_size.cmp(&b.file_size),
            "updatedAt" => a.updated_at.cmp(&b.updated_at),
            _ => a.created_at.cmp(&b.created_at),
        };
        if descending { ordering.reverse() } else { ordering }
    });
}

pub(crate) fn build_timeline(
    mut reports: Vec<Report>,
    query: &TimelineQuery,
) -> BTreeMap<String, Vec<Report>> {
    if let (Some(year), Some(month)) = (query.year, query.month) {
        reports.retain(|report| {
            let created = report.created_at.date_naive();
            created.year() == year && created.month() == month
        });
    }
    reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut timeline: BTreeMap<String, Vec<Report>> = BTreeMap::new();
    for report in reports {
        let day = report.created_at.format("%Y-%m-%d").to_string();
        timeline.entry(day).or_default().push(report);
    }
    timeline
}

/// Order by timestamp descending, truncate, then reverse: the result is
/// the oldest-first suffix of the log.
pub(crate) fn recent_window(messages: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    let mut ordered: Vec<ChatMessage> = messages.to_vec();
    ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    ordered.truncate(limit);
    ordered.reverse();
    ordered
}

pub(crate) fn history_window(
    messages: &[ChatMessage],
    limit: usize,
    offset: usize,
) -> ChatHistoryPage {
    let total_messages = messages.len();
    let mut ordered: Vec<ChatMessage> = messages.to_vec();
    ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut window: Vec<ChatMessage> = ordered.into_iter().skip(offset).take(limit).collect();
    window.reverse();

    ChatHistoryPage {
        messages: window,
        total_messages,
        has_more: offset + limit < total_messages,
    }
}

pub(crate) fn search_window(
    messages: &[ChatMessage],
    query: &str,
    limit: usize,
) -> Vec<ChatMessage> {
    let pattern = RegexBuilder::new(query).case_insensitive(true).build();
    let needle_lower = query.to_lowercase();

    let mut matches: Vec<ChatMessage> = messages
        .iter()
        .filter(|message| match &pattern {
            // The query is treated as a pattern when it is one, and as a
            // plain substring otherwise.
            Ok(re) => re.is_match(&message.content),
            Err(_) => message.content.to_lowercase().contains(&needle_lower),
        })
        .cloned()
        .collect();
    matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matches.truncate(limit);
    matches
}

pub(crate) fn stats_of(chat: Option<&Chat>) -> ChatStats {
    match chat {
        Some(chat) => {
            let user_messages = chat
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::User)
                .count();
            let ai_messages = chat
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::Assistant)
                .count();
            ChatStats {
                total_messages: chat.messages.len(),
                user_messages,
                ai_messages,
                last_activity: Some(chat.last_activity),
                is_active: chat.is_active,
            }
        }
        None => ChatStats {
            total_messages: 0,
            user_messages: 0,
            ai_messages: 0,
            last_activity: None,
            is_active: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn report(name: &str, size: u64, status: AnalysisStatus) -> Report {
        let mut report = Report::new(
            "user-1",
            format!("stored_{name}"),
            name,
            format!("/tmp/{name}"),
            "application/pdf",
            size,
            None,
            vec!["blood".to_string()],
            String::new(),
        );
        report.analysis_status = status;
        report
    }

    #[test]
    fn pagination_metadata_is_consistent() {
        let reports: Vec<Report> = (0..25)
            .map(|i| report(&format!("r{i}.pdf"), i, AnalysisStatus::Pending))
            .collect();

        let query = ListReportsQuery {
            page: Some(2),
            limit: Some(10),
            ..ListReportsQuery::default()
        };
        let page = filter_and_page(reports, &query);

        assert_eq!(page.reports.len(), 10);
        assert_eq!(page.pagination.current_page, 2);
        assert_eq!(page.pagination.total_pages, 3);
        assert_eq!(page.pagination.total_reports, 25);
        assert!(page.pagination.has_next);
        assert!(page.pagination.has_prev);
    }

    #[test]
    fn status_filter_and_search_compose() {
        let reports = vec![
            report("cbc-march.pdf", 1, AnalysisStatus::Completed),
            report("cbc-april.pdf", 2, AnalysisStatus::Failed),
            report("xray.pdf", 3, AnalysisStatus::Completed),
        ];

        let query = ListReportsQuery {
            status: Some(AnalysisStatus::Completed),
            search: Some("CBC".to_string()),
            ..ListReportsQuery::default()
        };
        let page = filter_and_page(reports, &query);

        assert_eq!(page.reports.len(), 1);
        assert_eq!(page.reports[0].original_name, "cbc-march.pdf");
    }

    #[test]
    fn sorting_by_file_size_ascending() {
        let reports = vec![
            report("b.pdf", 20, AnalysisStatus::Pending),
            report("a.pdf", 10, AnalysisStatus::Pending),
            report("c.pdf", 30, AnalysisStatus::Pending),
        ];

        let query = ListReportsQuery {
            sort_by: Some("fileSize".to_string()),
            sort_order: Some("asc".to_string()),
            ..ListReportsQuery::default()
        };
        let page = filter_and_page(reports, &query);

        let sizes: Vec<u64> = page.reports.iter().map(|r| r.file_size).collect();
        assert_eq!(sizes, vec![10, 20, 30]);
    }

    #[test]
    fn recent_window_is_an_oldest_first_suffix() {
        let mut messages = Vec::new();
        for i in 0..5 {
            let mut message = ChatMessage::new(
                MessageRole::User,
                format!("message {i}"),
                None,
                MessageType::Text,
            );
            message.timestamp = Utc::now() + chrono::Duration::seconds(i);
            messages.push(message);
        }

        let window = recent_window(&messages, 3);
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn history_window_counts_from_the_newest() {
        let mut messages = Vec::new();
        for i in 0..6 {
            let mut message = ChatMessage::new(
                MessageRole::User,
                format!("message {i}"),
                None,
                MessageType::Text,
            );
            message.timestamp = Utc::now() + chrono::Duration::seconds(i);
            messages.push(message);
        }

        let page = history_window(&messages, 2, 2);
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3"]);
        assert_eq!(page.total_messages, 6);
        assert!(page.has_more);

        let tail = history_window(&messages, 10, 4);
        assert_eq!(tail.messages.len(), 2);
        assert!(!tail.has_more);
    }

    #[test]
    fn search_is_case_insensitive_and_newest_first() {
        let mut older = ChatMessage::new(
            MessageRole::Assistant,
            "Your hemoglobin is fine",
            None,
            MessageType::Text,
        );
        older.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let newer = ChatMessage::new(
            MessageRole::User,
            "What about HEMOGLOBIN trends?",
            None,
            MessageType::Text,
        );
        let unrelated =
            ChatMessage::new(MessageRole::User, "thanks", None, MessageType::Text);

        let found = search_window(&[older, newer, unrelated], "hemoglobin", 10);
        assert_eq!(found.len(), 2);
        assert!(found[0].content.starts_with("What about"));
    }

    #[test]
    fn invalid_regex_falls_back_to_substring() {
        let message = ChatMessage::new(
            MessageRole::User,
            "value is (low)",
            None,
            MessageType::Text,
        );

        let found = search_window(&[message], "(low", 10);
        assert_eq!(found.len(), 1);
    }
}
