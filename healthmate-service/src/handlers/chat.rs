use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::auth::AuthUser;
use crate::models::{
    ChatHistoryQuery, ChatSearchQuery, MessageRole, MessageType, SendMessageRequest,
};
use crate::service::{
    ApiError, ApiResult, AppState, bad_request, internal_error, not_found, success,
    success_message,
};

const APOLOGY_MESSAGE: &str =
    "I apologize, but I encountered an error processing your request. Please try again.";

const DEFAULT_RECENT_LIMIT: usize = 50;
const DEFAULT_SEARCH_LIMIT: usize = 20;
const CONTEXT_REPORT_COUNT: usize = 3;
const CONTEXT_EXCERPT_CHARS: usize = 200;

/// `GET /chat`: get-or-create the user's conversation and return its
/// recent window.
pub async fn get_chat(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Value> {
    let chat = state.chats.get_or_create(&auth.user.id).await.map_err(|e| {
        error!("Failed to load chat for {}: {}", auth.user.id, e);
        internal_error("Server error while fetching chat")
    })?;
    let messages = state
        .chats
        .recent_messages(&auth.user.id, DEFAULT_RECENT_LIMIT)
        .await
        .map_err(|e| {
            error!("Failed to load messages for {}: {}", auth.user.id, e);
            internal_error("Server error while fetching chat")
        })?;

    Ok(success(json!({
        "chat": {
            "id": chat.id,
            "messages": messages,
            "lastActivity": chat.last_activity,
            "isActive": chat.is_active,
        }
    })))
}

/// `POST /chat/message`: append the user's message, ask the assistant
/// with report context, append the reply. A failed model call still leaves
/// a visible assistant message so the thread is never silently broken.
pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(bad_request("Message cannot be empty"));
    }
    let report_id = request.report_id.as_deref();

    let user_message = state
        .chats
        .add_message(
            &auth.user.id,
            MessageRole::User,
            message,
            report_id,
            MessageType::Text,
        )
        .await
        .map_err(|e| {
            error!("Failed to store message for {}: {}", auth.user.id, e);
            internal_error("Server error while sending message")
        })?;

    let context = build_report_context(&state, &auth.user.id, report_id).await;

    match state.client.chat(message, &context).await {
        Ok(reply) => {
            let ai_message = state
                .chats
                .add_message(
                    &auth.user.id,
                    MessageRole::Assistant,
                    &reply,
                    report_id,
                    MessageType::Text,
                )
                .await
                .map_err(|e| {
                    error!("Failed to store assistant reply for {}: {}", auth.user.id, e);
                    internal_error("Server error while sending message")
                })?;

            Ok(success(json!({
                "userMessage": user_message,
                "aiResponse": ai_message,
            })))
        }
        Err(chat_error) => {
            error!("Chat reply failed for {}: {}", auth.user.id, chat_error);

            // Canned apology so the conversation still shows a reply.
            let ai_message = state
                .chats
                .add_message(
                    &auth.user.id,
                    MessageRole::Assistant,
                    APOLOGY_MESSAGE,
                    report_id,
                    MessageType::Text,
                )
                .await
                .map_err(|e| {
                    error!("Failed to store apology for {}: {}", auth.user.id, e);
                    internal_error("Server error while sending message")
                })?;

            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "message": "Error generating AI response",
                    "data": {
                        "userMessage": user_message,
                        "aiResponse": ai_message,
                    }
                })),
            ))
        }
    }
}

/// Context handed to the assistant: the referenced report's summary, or
/// excerpts from the newest analyzed reports when no reference was given.
async fn build_report_context(state: &AppState, user_id: &str, report_id: Option<&str>) -> String {
    if let Some(report_id) = report_id {
        match state.reports.get(report_id, user_id).await {
            Ok(Some(report)) if !report.ai_summary.english.is_empty() => {
                return format!(
                    "Recent report context: {}\nSummary: {}",
                    report.original_name, report.ai_summary.english
                );
            }
            Ok(_) => return String::new(),
            Err(e) => {
                error!("Failed to load report {} for context: {}", report_id, e);
                return String::new();
            }
        }
    }

    match state.reports.recent_completed(user_id, CONTEXT_REPORT_COUNT).await {
        Ok(reports) if !reports.is_empty() => {
            let mut context = String::from("Recent reports context:\n");
            for report in reports {
                let excerpt: String = report
                    .ai_summary
                    .english
                    .chars()
                    .take(CONTEXT_EXCERPT_CHARS)
                    .collect();
                context.push_str(&format!("{}: {}...\n", report.original_name, excerpt));
            }
            context
        }
        Ok(_) => String::new(),
        Err(e) => {
            error!("Failed to load recent reports for context: {}", e);
            String::new()
        }
    }
}

pub async fn chat_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ChatHistoryQuery>,
) -> ApiResult<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let page = state
        .chats
        .history(&auth.user.id, limit, offset)
        .await
        .map_err(|e| {
            error!("Failed to load history for {}: {}", auth.user.id, e);
            internal_error("Server error while fetching chat history")
        })?;

    Ok(success(json!({
        "messages": page.messages,
        "totalMessages": page.total_messages,
        "hasMore": page.has_more,
    })))
}

pub async fn clear_chat_history(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Value> {
    let cleared = state.chats.clear_history(&auth.user.id).await.map_err(|e| {
        error!("Failed to clear history for {}: {}", auth.user.id, e);
        internal_error("Server error while clearing chat history")
    })?;

    if !cleared {
        return Err(not_found("Chat not found"));
    }

    info!("Cleared chat history for user {}", auth.user.id);
    Ok(success_message("Chat history cleared successfully"))
}

pub async fn chat_stats(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Value> {
    let stats = state.chats.stats(&auth.user.id).await.map_err(|e| {
        error!("Failed to load chat stats for {}: {}", auth.user.id, e);
        internal_error("Server error while fetching chat statistics")
    })?;

    Ok(success(json!(stats)))
}

pub async fn search_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ChatSearchQuery>,
) -> ApiResult<Value> {
    let Some(needle) = query
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
    else {
        return Err(bad_request("Search query is required"));
    };
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);

    let messages = state
        .chats
        .search(&auth.user.id, needle, limit)
        .await
        .map_err(|e| {
            error!("Failed to search chat for {}: {}", auth.user.id, e);
            internal_error("Server error while searching messages")
        })?;

    let total_results = messages.len();
    Ok(success(json!({
        "messages": messages,
        "totalResults": total_results,
        "query": needle,
    })))
}
