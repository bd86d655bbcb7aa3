//! Postgres-backed stores (`postgres` cargo feature).
//!
//! Aggregates are persisted as JSONB documents keyed by id/owner, so both
//! backends run the same pure query helpers and stay behaviorally
//! identical. Pipeline status transitions are expressed as conditional
//! JSONB merges so the pending/failed → processing guard holds at the row
//! level.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use super::{
    ChatHistoryPage, ChatStore, ReportPage, ReportStore, StoreError, StoreResult, UserStore,
    build_timeline, filter_and_page, history_window, recent_window, search_window, stats_of,
};
use crate::models::{
    AiSummary, AnalysisStatus, Chat, ChatMessage, ChatStats, ListReportsQuery, MessageRole,
    MessageType, Report, TimelineQuery, UpdateReportRequest, User,
};

/// Connect, run the idempotent schema setup, and hand back one store per
/// aggregate sharing the pool.
pub async fn connect(
    database_url: &str,
) -> StoreResult<(PgReportStore, PgChatStore, PgUserStore)> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(backend)?;

    migrate(&pool).await?;
    info!("Connected to Postgres store");

    Ok((
        PgReportStore { pool: pool.clone() },
        PgChatStore { pool: pool.clone() },
        PgUserStore { pool },
    ))
}

async fn migrate(pool: &PgPool) -> StoreResult<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS reports (id TEXT PRIMARY KEY, user_id TEXT NOT NULL, data JSONB NOT NULL)",
        "CREATE INDEX IF NOT EXISTS reports_user_idx ON reports (user_id)",
        "CREATE TABLE IF NOT EXISTS chats (user_id TEXT PRIMARY KEY, data JSONB NOT NULL)",
        "CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY, email TEXT UNIQUE NOT NULL, data JSONB NOT NULL)",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await.map_err(backend)?;
    }
    Ok(())
}

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Backend(e.to_string()))
}

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    async fn user_reports(&self, user_id: &str) -> StoreResult<Vec<Report>> {
        let rows = sqlx::query("SELECT data FROM reports WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(|row| decode(row.get::<Value, _>("data")))
            .collect()
    }

    /// Merge a partial JSON document into the report row, optionally gated
    /// on the current status. Returns whether a row was updated.
    async fn merge_patch(
        &self,
        id: &str,
        patch: Value,
        guard: Option<&str>,
    ) -> StoreResult<bool> {
        let sql = match guard {
            Some(condition) => format!(
                "UPDATE reports SET data = data || $2 WHERE id = $1 AND {}",
                condition
            ),
            None => "UPDATE reports SET data = data || $2 WHERE id = $1".to_string(),
        };
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(patch)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM reports WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn create(&self, report: Report) -> StoreResult<Report> {
        sqlx::query(
            "INSERT INTO reports (id, user_id, data) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&report.id)
        .bind(&report.user_id)
        .bind(encode(&report)?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(report)
    }

    async fn get(&self, id: &str, user_id: &str) -> StoreResult<Option<Report>> {
        let row = sqlx::query("SELECT data FROM reports WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| decode(row.get::<Value, _>("data"))).transpose()
    }

    async fn list(&self, user_id: &str, query: &ListReportsQuery) -> StoreResult<ReportPage> {
        Ok(filter_and_page(self.user_reports(user_id).await?, query))
    }

    async fn update_metadata(
        &self,
        id: &str,
        user_id: &str,
        patch: &UpdateReportRequest,
    ) -> StoreResult<Option<Report>> {
        let Some(mut report) = self.get(id, user_id).await? else {
            return Ok(None);
        };
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

        sqlx::query("UPDATE reports SET data = $2 WHERE id = $1")
            .bind(id)
            .bind(encode(&report)?)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Some(report))
    }

    async fn delete(&self, id: &str, user_id: &str) -> StoreResult<Option<Report>> {
        let row =
            sqlx::query("DELETE FROM reports WHERE id = $1 AND user_id = $2 RETURNING data")
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        row.map(|row| decode(row.get::<Value, _>("data"))).transpose()
    }

    async fn timeline(
        &self,
        user_id: &str,
        query: &TimelineQuery,
    ) -> StoreResult<BTreeMap<String, Vec<Report>>> {
        Ok(build_timeline(self.user_reports(user_id).await?, query))
    }

    async fn recent_completed(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Report>> {
        let mut completed: Vec<Report> = self
            .user_reports(user_id)
            .await?
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
        let patch = json!({
            "analysisStatus": AnalysisStatus::Processing,
            "analysisError": Value::Null,
            "updatedAt": Utc::now(),
        });
        let updated = self
            .merge_patch(
                id,
                patch,
                Some("data->>'analysisStatus' IN ('pending', 'failed')"),
            )
            .await?;
        if updated {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn complete_analysis(&self, id: &str, summary: AiSummary) -> StoreResult<()> {
        let patch = json!({
            "analysisStatus": AnalysisStatus::Completed,
            "analysisError": Value::Null,
            "aiSummary": summary,
            "updatedAt": Utc::now(),
        });
        if self.merge_patch(id, patch, None).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn fail_analysis(&self, id: &str, error: &str) -> StoreResult<()> {
        let patch = json!({
            "analysisStatus": AnalysisStatus::Failed,
            "analysisError": error,
            "aiSummary": AiSummary::default(),
            "updatedAt": Utc::now(),
        });
        if self.merge_patch(id, patch, None).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn reset_for_retry(&self, id: &str) -> StoreResult<()> {
        let patch = json!({
            "analysisStatus": AnalysisStatus::Pending,
            "analysisError": Value::Null,
            "aiSummary": AiSummary::default(),
            "updatedAt": Utc::now(),
        });
        if self.merge_patch(id, patch, None).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }
}

/// The chat row is replaced whole on every write; concurrent writers are
/// last-write-wins, same as the in-memory backend.
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    async fn load(&self, user_id: &str) -> StoreResult<Option<Chat>> {
        let row = sqlx::query("SELECT data FROM chats WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| decode(row.get::<Value, _>("data"))).transpose()
    }

    async fn save(&self, chat: &Chat) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chats (user_id, data) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&chat.user_id)
        .bind(encode(chat)?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn get_or_create(&self, user_id: &str) -> StoreResult<Chat> {
        if let Some(chat) = self.load(user_id).await? {
            return Ok(chat);
        }
        let chat = Chat::new(user_id);
        self.save(&chat).await?;
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
        let mut chat = self.get_or_create(user_id).await?;
        let message =
            ChatMessage::new(role, content, report_id.map(str::to_string), message_type);
        chat.messages.push(message.clone());
        chat.last_activity = Utc::now();
        self.save(&chat).await?;
        Ok(message)
    }

    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .load(user_id)
            .await?
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
            .load(user_id)
            .await?
            .map(|chat| history_window(&chat.messages, limit, offset))
            .unwrap_or(ChatHistoryPage {
                messages: Vec::new(),
                total_messages: 0,
                has_more: false,
            }))
    }

    async fn clear_history(&self, user_id: &str) -> StoreResult<bool> {
        let Some(mut chat) = self.load(user_id).await? else {
            return Ok(false);
        };
        chat.messages.clear();
        chat.last_activity = Utc::now();
        self.save(&chat).await?;
        Ok(true)
    }

    async fn stats(&self, user_id: &str) -> StoreResult<ChatStats> {
        Ok(stats_of(self.load(user_id).await?.as_ref()))
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .load(user_id)
            .await?
            .map(|chat| search_window(&chat.messages, query, limit))
            .unwrap_or_default())
    }
}

pub struct PgUserStore {
    pool: PgPool,
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, user: User) -> StoreResult<User> {
        let result = sqlx::query(
            "INSERT INTO users (id, email, data) VALUES ($1, $2, $3) \
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(&user.id)
        .bind(user.email.to_lowercase())
        .bind(encode(&user)?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateEmail);
        }
        Ok(user)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT data FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| decode(row.get::<Value, _>("data"))).transpose()
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT data FROM users WHERE email = $1")
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| decode(row.get::<Value, _>("data"))).transpose()
    }

    async fn update_name(&self, id: &str, name: &str) -> StoreResult<Option<User>> {
        let Some(mut user) = self.get(id).await? else {
            return Ok(None);
        };
        user.name = name.to_string();
        sqlx::query("UPDATE users SET data = $2 WHERE id = $1")
            .bind(id)
            .bind(encode(&user)?)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Some(user))
    }

    async fn update_password(&self, id: &str, password_hash: &str) -> StoreResult<Option<User>> {
        let Some(mut user) = self.get(id).await? else {
            return Ok(None);
        };
        user.password_hash = password_hash.to_string();
        sqlx::query("UPDATE users SET data = $2 WHERE id = $1")
            .bind(id)
            .bind(encode(&user)?)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Some(user))
    }
}
