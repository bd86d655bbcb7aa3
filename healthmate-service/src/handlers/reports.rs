use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use job_flow::JobError;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::auth::AuthUser;
use crate::models::{
    ALLOWED_FILE_TYPES, AnalysisStatus, ListReportsQuery, MAX_FILE_SIZE, Report, TimelineQuery,
    UpdateReportRequest, dedupe_tags,
};
use crate::service::{
    ApiError, ApiResult, AppState, bad_request, internal_error, not_found, success,
    success_message,
};

struct UploadedFile {
    original_name: String,
    content_type: String,
    bytes: Vec<u8>,
}

/// `POST /reports/upload`: multipart form with the file under `report`,
/// plus optional `tags` (comma separated) and `notes` fields. Responds as
/// soon as the pending record exists; analysis happens in the background.
pub async fn upload_report(
    State(state): State<AppState>,
    auth: AuthUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (file, tags, notes) = read_upload_form(multipart).await?;
    let Some(file) = file else {
        return Err(bad_request("No file uploaded"));
    };

    if !ALLOWED_FILE_TYPES.contains(&file.content_type.as_str()) {
        return Err(bad_request(
            "Invalid file type. Only JPEG, PNG, and PDF files are allowed.",
        ));
    }
    if file.bytes.is_empty() {
        return Err(bad_request("Uploaded file is empty"));
    }
    if file.bytes.len() > MAX_FILE_SIZE {
        return Err(bad_request("File too large. Maximum size is 10 MB."));
    }

    let file_size = file.bytes.len() as u64;
    let stored = state
        .files
        .store(&file.original_name, &file.content_type, file.bytes)
        .await
        .map_err(|e| {
            error!("Failed to store uploaded file: {}", e);
            internal_error("Server error during report upload")
        })?;

    let storage_id = stored.storage_id.clone();
    let report = Report::new(
        &auth.user.id,
        stored.file_name,
        &file.original_name,
        stored.url,
        &file.content_type,
        file_size,
        stored.storage_id,
        tags,
        notes,
    );

    let report = match state.reports.create(report).await {
        Ok(report) => report,
        Err(e) => {
            error!("Failed to persist report record: {}", e);
            // The file made it to storage but the record did not; try to
            // release it so it does not leak.
            if let Some(storage_id) = storage_id {
                if let Err(delete_error) = state.files.delete(&storage_id).await {
                    warn!(
                        "Failed to clean up stored file {}: {}",
                        storage_id, delete_error
                    );
                }
            }
            return Err(internal_error("Server error during report upload"));
        }
    };

    if let Err(e) = state.pipeline.start(&report) {
        // The record stays pending and can be retried by hand.
        error!("Failed to queue analysis for report {}: {}", report.id, e);
    }

    info!(
        "Report {} uploaded by user {} ({} bytes)",
        report.id, auth.user.id, file_size
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Report uploaded successfully. AI analysis in progress.",
            "data": { "report": upload_summary(&report) }
        })),
    ))
}

async fn read_upload_form(
    mut multipart: Multipart,
) -> Result<(Option<UploadedFile>, Vec<String>, String), ApiError> {
    let mut file = None;
    let mut tags = Vec::new();
    let mut notes = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&format!("Invalid multipart payload: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("report") => {
                let original_name = field
                    .file_name()
                    .filter(|n| !n.is_empty())
                    .unwrap_or("report")
                    .to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(&format!("Failed to read uploaded file: {e}")))?;
                file = Some(UploadedFile {
                    original_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            Some("tags") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| bad_request(&format!("Invalid tags field: {e}")))?;
                tags = dedupe_tags(
                    raw.split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
            }
            Some("notes") => {
                notes = field
                    .text()
                    .await
                    .map_err(|e| bad_request(&format!("Invalid notes field: {e}")))?;
            }
            _ => {}
        }
    }

    Ok((file, tags, notes))
}

fn upload_summary(report: &Report) -> Value {
    json!({
        "id": report.id,
        "userId": report.user_id,
        "fileName": report.file_name,
        "originalName": report.original_name,
        "fileUrl": report.file_url,
        "fileType": report.file_type,
        "fileSize": report.file_size,
        "analysisStatus": report.analysis_status,
        "tags": report.tags,
        "notes": report.notes,
        "createdAt": report.created_at,
    })
}

pub async fn list_reports(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListReportsQuery>,
) -> ApiResult<Value> {
    let page = state
        .reports
        .list(&auth.user.id, &query)
        .await
        .map_err(|e| {
            error!("Failed to list reports for {}: {}", auth.user.id, e);
            internal_error("Server error while fetching reports")
        })?;

    Ok(success(json!({
        "reports": page.reports,
        "pagination": page.pagination,
    })))
}

pub async fn get_report(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let report = state
        .reports
        .get(&id, &auth.user.id)
        .await
        .map_err(|e| {
            error!("Failed to fetch report {}: {}", id, e);
            internal_error("Server error while fetching report")
        })?
        .ok_or_else(|| not_found("Report not found"))?;

    Ok(success(json!({ "report": report })))
}

pub async fn update_report(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(mut patch): Json<UpdateReportRequest>,
) -> ApiResult<Value> {
    patch.tags = patch.tags.map(dedupe_tags);
    let report = state
        .reports
        .update_metadata(&id, &auth.user.id, &patch)
        .await
        .map_err(|e| {
            error!("Failed to update report {}: {}", id, e);
            internal_error("Server error while updating report")
        })?
        .ok_or_else(|| not_found("Report not found"))?;

    Ok(Json(json!({
        "success": true,
        "message": "Report updated successfully",
        "data": { "report": report }
    })))
}

pub async fn delete_report(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let report = state
        .reports
        .delete(&id, &auth.user.id)
        .await
        .map_err(|e| {
            error!("Failed to delete report {}: {}", id, e);
            internal_error("Server error while deleting report")
        })?
        .ok_or_else(|| not_found("Report not found"))?;

    // Metadata removal wins over storage cleanup: a provider failure here
    // is logged and the stored file may leak.
    if let Some(storage_id) = &report.storage_id {
        if let Err(e) = state.files.delete(storage_id).await {
            warn!("Failed to delete stored file {}: {}", storage_id, e);
        }
    }

    Ok(success_message("Report deleted successfully"))
}

pub async fn reports_timeline(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Value> {
    let timeline = state
        .reports
        .timeline(&auth.user.id, &query)
        .await
        .map_err(|e| {
            error!("Failed to build timeline for {}: {}", auth.user.id, e);
            internal_error("Server error while fetching timeline")
        })?;

    Ok(success(json!({ "timeline": timeline })))
}

/// `POST /reports/{id}/retry-analysis`: re-enter the pipeline. Rejected
/// while an analysis is visibly in progress; the queue's duplicate guard
/// is the backstop for the race where two retries pass the check together.
pub async fn retry_analysis(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let report = state
        .reports
        .get(&id, &auth.user.id)
        .await
        .map_err(|e| {
            error!("Failed to fetch report {}: {}", id, e);
            internal_error("Server error while retrying analysis")
        })?
        .ok_or_else(|| not_found("Report not found"))?;

    if report.analysis_status == AnalysisStatus::Processing {
        return Err(bad_request("Analysis already in progress"));
    }

    state
        .reports
        .reset_for_retry(&report.id)
        .await
        .map_err(|e| {
            error!("Failed to reset report {} for retry: {}", report.id, e);
            internal_error("Server error while retrying analysis")
        })?;

    match state.pipeline.start(&report) {
        Ok(_) => Ok(success_message("Analysis retry initiated")),
        Err(JobError::AlreadyRunning(_)) => Err(bad_request("Analysis already in progress")),
        Err(e) => {
            error!("Failed to queue retry for report {}: {}", report.id, e);
            Err(internal_error("Server error while retrying analysis"))
        }
    }
}
