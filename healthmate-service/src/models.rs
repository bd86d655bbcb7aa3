use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content types accepted for uploaded report files.
pub const ALLOWED_FILE_TYPES: [&str; 4] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "application/pdf",
];

/// Upload size cap in bytes (10 MB).
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Where a report is in the analysis lifecycle.
///
/// `pending → processing → completed | failed`; a failed report can be
/// reset to `pending` through the retry endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Structured summary extracted from the model's free-text reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiSummary {
    pub english: String,
    pub roman_urdu: String,
    pub key_findings: Vec<String>,
    pub abnormal_values: Vec<String>,
    pub recommendations: Vec<String>,
    pub doctor_questions: Vec<String>,
}

impl AiSummary {
    /// True when the parser captured nothing at all.
    pub fn is_empty(&self) -> bool {
        self.english.is_empty()
            && self.roman_urdu.is_empty()
            && self.key_findings.is_empty()
            && self.abnormal_values.is_empty()
            && self.recommendations.is_empty()
            && self.doctor_questions.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub user_id: String,
    pub file_name: String,
    pub original_name: String,
    pub file_url: String,
    pub file_type: String,
    pub file_size: u64,
    /// Provider-assigned handle used to release the stored file on delete.
    pub storage_id: Option<String>,
    pub analysis_status: AnalysisStatus,
    /// Populated only while `analysis_status` is `failed`.
    pub analysis_error: Option<String>,
    /// Populated only once `analysis_status` is `completed`.
    pub ai_summary: AiSummary,
    pub tags: Vec<String>,
    pub is_important: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(
        user_id: impl Into<String>,
        file_name: impl Into<String>,
        original_name: impl Into<String>,
        file_url: impl Into<String>,
        file_type: impl Into<String>,
        file_size: u64,
        storage_id: Option<String>,
        tags: Vec<String>,
        notes: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            file_name: file_name.into(),
            original_name: original_name.into(),
            file_url: file_url.into(),
            file_type: file_type.into(),
            file_size,
            storage_id,
            analysis_status: AnalysisStatus::Pending,
            analysis_error: None,
            ai_summary: AiSummary::default(),
            tags,
            is_important: false,
            notes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Tags behave as a set that keeps first-seen order.
pub fn dedupe_tags(tags: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if !unique.contains(&tag) {
            unique.push(tag);
        }
    }
    unique
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    ReportAnalysis,
    Question,
    Summary,
}

/// One entry in a user's conversation log. Messages are immutable once
/// appended; only a whole-chat clear removes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub report_id: Option<String>,
    pub message_type: MessageType,
}

impl ChatMessage {
    pub fn new(
        role: MessageRole,
        content: impl Into<String>,
        report_id: Option<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            report_id,
            message_type,
        }
    }
}

/// Per-user conversation aggregate, created lazily on first access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            messages: Vec::new(),
            last_activity: now,
            is_active: true,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    /// `salt$digest`, both hex encoded. Never exposed to clients.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            created_at: Utc::now(),
        }
    }
}

/// Client-facing view of a user, without the credential hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Partial update of the user-editable report metadata.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReportRequest {
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
    pub is_important: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListReportsQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub status: Option<AnalysisStatus>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: String,
    pub report_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatHistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatSearchQuery {
    pub query: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u64,
    pub total_pages: u64,
    pub total_reports: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub ai_messages: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub is_active: bool,
}
