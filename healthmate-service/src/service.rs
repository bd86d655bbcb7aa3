use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
};
use job_flow::JobQueue;
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::ai::{AnalysisClient, OpenRouterClient};
use crate::auth::TokenStore;
use crate::files::{FileStorage, HttpFileStorage, LocalFileStorage};
use crate::handlers::{auth, chat, reports};
use crate::models::MAX_FILE_SIZE;
use crate::pipeline::AnalysisPipeline;
use crate::store::{
    ChatStore, InMemoryChatStore, InMemoryReportStore, InMemoryUserStore, ReportStore, UserStore,
};

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// `{"success": false, "message": ...}`; every error leaves through here.
pub(crate) fn error_response(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(json!({ "success": false, "message": message })),
    )
}

pub(crate) fn bad_request(message: &str) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn unauthorized(message: &str) -> ApiError {
    error_response(StatusCode::UNAUTHORIZED, message)
}

pub(crate) fn not_found(message: &str) -> ApiError {
    error_response(StatusCode::NOT_FOUND, message)
}

/// Internal errors carry a generic message; the detail goes to the log.
pub(crate) fn internal_error(message: &str) -> ApiError {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

pub(crate) fn success(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub(crate) fn success_message(message: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": message }))
}

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub reports: Arc<dyn ReportStore>,
    pub chats: Arc<dyn ChatStore>,
    pub files: Arc<dyn FileStorage>,
    pub client: Arc<dyn AnalysisClient>,
    pub pipeline: Arc<AnalysisPipeline>,
    pub tokens: Arc<TokenStore>,
}

pub async fn create_app() -> Router {
    let app_state = create_app_state().await;
    build_router(app_state)
}

async fn create_app_state() -> AppState {
    let client: Arc<dyn AnalysisClient> = match OpenRouterClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to configure analysis client: {}", e);
            std::process::exit(1);
        }
    };

    let (users, reports, chats) = create_stores().await;
    let files = create_file_storage();

    let timeout_secs = env_u64("ANALYSIS_TIMEOUT_SECS", 120);
    let queue = JobQueue::with_timeout(Duration::from_secs(timeout_secs));
    let pipeline = Arc::new(AnalysisPipeline::new(
        Arc::clone(&reports),
        Arc::clone(&chats),
        Arc::clone(&client),
        queue,
    ));

    let token_ttl_days = env_u64("TOKEN_TTL_DAYS", 7);
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(
        token_ttl_days * 24 * 60 * 60,
    )));

    AppState {
        users,
        reports,
        chats,
        files,
        client,
        pipeline,
        tokens,
    }
}

async fn create_stores() -> (Arc<dyn UserStore>, Arc<dyn ReportStore>, Arc<dyn ChatStore>) {
    #[cfg(feature = "postgres")]
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        match crate::store::postgres::connect(&database_url).await {
            Ok((reports, chats, users)) => {
                return (Arc::new(users), Arc::new(reports), Arc::new(chats));
            }
            Err(e) => {
                error!("Failed to connect to PostgreSQL: {}", e);
                std::process::exit(1);
            }
        }
    }

    (
        Arc::new(InMemoryUserStore::new()),
        Arc::new(InMemoryReportStore::new()),
        Arc::new(InMemoryChatStore::new()),
    )
}

fn create_file_storage() -> Arc<dyn FileStorage> {
    match (
        std::env::var("STORAGE_BASE_URL"),
        std::env::var("STORAGE_API_KEY"),
    ) {
        (Ok(base_url), Ok(api_key)) => Arc::new(HttpFileStorage::new(base_url, api_key)),
        _ => {
            let upload_dir =
                std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string());
            Arc::new(LocalFileStorage::new(upload_dir))
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/profile", get(auth::get_profile).put(auth::update_profile))
        .route("/auth/change-password", put(auth::change_password))
        .route("/auth/logout", post(auth::logout))
        .route("/reports/upload", post(reports::upload_report))
        .route("/reports", get(reports::list_reports))
        .route("/reports/timeline", get(reports::reports_timeline))
        .route(
            "/reports/{id}",
            get(reports::get_report)
                .put(reports::update_report)
                .delete(reports::delete_report),
        )
        .route("/reports/{id}/retry-analysis", post(reports::retry_analysis))
        .route("/chat", get(chat::get_chat))
        .route("/chat/message", post(chat::send_message))
        .route(
            "/chat/history",
            get(chat::chat_history).delete(chat::clear_chat_history),
        )
        .route("/chat/stats", get(chat::chat_stats))
        .route("/chat/search", get(chat::search_chat))
        .layer(DefaultBodyLimit::max(MAX_FILE_SIZE + 64 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "HealthMate Medical Report Service",
        "version": "1.0.0",
        "description": "AI-powered medical report analysis with a bilingual chat assistant",
        "endpoints": {
            "POST /auth/register": "Create an account",
            "POST /auth/login": "Log in and receive a bearer token",
            "POST /reports/upload": "Upload a report file for analysis",
            "GET /reports": "List reports with filtering and pagination",
            "POST /reports/{id}/retry-analysis": "Retry a failed analysis",
            "GET /chat": "Fetch the conversation with the assistant",
            "POST /chat/message": "Ask the assistant a question",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
