//! Upload and single-batch handlers.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::helpers::{ok, ok_with_message, ApiError, ApiResult};
use super::super::AppState;
use crate::gemini::{JobHandle, JobStatus};
use crate::models::{parse_csv, Item, ItemLoadError};

const PREVIEW_LEN: usize = 10;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub total_rugs: usize,
    pub preview: Vec<Item>,
    pub has_more: bool,
}

/// Parse an uploaded CSV body and keep its items for the next pipeline.
pub async fn upload(State(state): State<AppState>, body: String) -> ApiResult<UploadSummary> {
    if body.trim().is_empty() {
        return Err(ApiError::bad_request("No file uploaded"));
    }

    let items = parse_csv(body.as_bytes(), &state.settings.prompt_template).map_err(|e| match e {
        ItemLoadError::Empty => ApiError::bad_request("CSV contains no rows"),
        other => ApiError::bad_request("Failed to parse CSV").with_details(other.to_string()),
    })?;

    let total = items.len();
    let preview = items.iter().take(PREVIEW_LEN).cloned().collect();
    state
        .logger
        .info("UPLOAD", format!("Parsed {} items from upload", total));
    *state.items.write().await = items;

    Ok(ok_with_message(
        format!("Successfully parsed {} rugs", total),
        UploadSummary {
            total_rugs: total,
            preview,
            has_more: total > PREVIEW_LEN,
        },
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatchRequest {
    #[serde(default)]
    pub jsonl_content: String,
    pub display_name: Option<String>,
}

/// Submit a pre-built JSONL payload as one batch job.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> ApiResult<JobStatus> {
    if request.jsonl_content.trim().is_empty() {
        return Err(ApiError::bad_request("JSONL content is required"));
    }

    let display_name = request.display_name.unwrap_or_else(|| {
        format!("Rug Batch - {}", chrono::Utc::now().format("%Y-%m-%d"))
    });
    let status = state
        .service
        .submit(&display_name, &request.jsonl_content)
        .await?;

    state.logger.info(
        "BATCH",
        format!("Submitted batch {} ({})", status.batch_id, display_name),
    );
    Ok(ok_with_message("Batch job created", status))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusQuery {
    pub batch_id: Option<String>,
}

fn require_batch_id(batch_id: Option<String>) -> Result<JobHandle, ApiError> {
    match batch_id {
        Some(id) if !id.trim().is_empty() => Ok(JobHandle::new(id.trim())),
        _ => Err(ApiError::bad_request("batchId is required")),
    }
}

pub async fn batch_status(
    State(state): State<AppState>,
    Query(query): Query<BatchStatusQuery>,
) -> ApiResult<JobStatus> {
    let job = require_batch_id(query.batch_id)?;
    let status = state.service.get_status(&job).await?;
    Ok(ok(status))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchActionRequest {
    pub batch_id: Option<String>,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchActionResult {
    pub batch_id: String,
    pub action: String,
}

/// `cancel` or `delete` a batch job.
pub async fn batch_action(
    State(state): State<AppState>,
    Json(request): Json<BatchActionRequest>,
) -> ApiResult<BatchActionResult> {
    let job = require_batch_id(request.batch_id)?;

    match request.action.as_str() {
        "cancel" => state.service.cancel(&job).await?,
        "delete" => state.service.delete(&job).await?,
        other => {
            return Err(ApiError::bad_request(format!(
                "Invalid action '{}', expected cancel or delete",
                other
            )))
        }
    }

    state
        .logger
        .info("BATCH", format!("Batch {} {}", job.id(), request.action));
    Ok(ok_with_message(
        format!("Batch {} requested", request.action),
        BatchActionResult {
            batch_id: job.id().to_string(),
            action: request.action,
        },
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedResults {
    pub file_name: String,
    pub content: String,
    pub result_count: usize,
}

/// Fetch a result file's raw JSONL.
pub async fn download_results(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<DownloadedResults> {
    let file_name = query
        .file_name
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("fileName is required"))?;

    let content = state.service.download(&file_name).await?;
    let result_count = content.lines().filter(|l| !l.trim().is_empty()).count();

    Ok(ok(DownloadedResults {
        file_name,
        content,
        result_count,
    }))
}
