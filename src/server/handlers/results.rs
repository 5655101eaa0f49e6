//! Result extraction and image archive handlers.

use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::helpers::{ok, ApiError, ApiResult};
use super::super::AppState;
use crate::results::{archive_name, extract_images, list_image_dates, zip_images, ImageDate, SavedResults};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRequest {
    #[serde(default)]
    pub batch_results: String,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    pub key: String,
    pub mime_type: String,
    pub data_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResponse {
    pub images: Vec<ImageData>,
    pub errors: Vec<String>,
    pub total_results: usize,
}

/// Decode images from result JSONL without touching disk.
pub async fn extract(Json(request): Json<ExtractRequest>) -> ApiResult<ExtractResponse> {
    if request.batch_results.trim().is_empty() {
        return Err(ApiError::bad_request("batchResults is required"));
    }

    let extraction = extract_images(&request.batch_results, &request.keys, request.chunk_index);
    let engine = base64::engine::general_purpose::STANDARD;
    let images = extraction
        .images
        .into_iter()
        .map(|image| ImageData {
            data_url: format!("data:{};base64,{}", image.mime_type, engine.encode(&image.data)),
            key: image.key,
            mime_type: image.mime_type,
        })
        .collect();

    Ok(ok(ExtractResponse {
        images,
        errors: extraction.errors,
        total_results: extraction.total_lines,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    #[serde(default)]
    pub jsonl_content: String,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Write result JSONL and its images under today's output folder.
pub async fn save_and_extract(
    State(state): State<AppState>,
    Json(request): Json<SaveRequest>,
) -> ApiResult<SavedResults> {
    if request.jsonl_content.trim().is_empty() {
        return Err(ApiError::bad_request("jsonlContent is required"));
    }

    let saved = state
        .results
        .save_and_extract(request.chunk_index, &request.jsonl_content, &request.keys)
        .await?;
    Ok(ok(saved))
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: Option<String>,
}

/// Zip of all images for a date (default today).
pub async fn download_all_images(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let date = query
        .date
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
    let output_dir = state.results.output_dir().to_path_buf();

    let zip_date = date.clone();
    let bytes = tokio::task::spawn_blocking(move || zip_images(&output_dir, &zip_date))
        .await
        .map_err(|e| {
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Archive task failed: {}", e),
            )
        })??;

    state.logger.info(
        "ARCHIVE",
        format!("Built {} ({} bytes)", archive_name(&date), bytes.len()),
    );

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", archive_name(&date)),
            ),
        ],
        bytes,
    ))
}

/// Date folders containing images, newest first.
pub async fn image_dates(State(state): State<AppState>) -> ApiResult<Vec<ImageDate>> {
    let output_dir = state.results.output_dir().to_path_buf();
    let dates = tokio::task::spawn_blocking(move || list_image_dates(&output_dir))
        .await
        .map_err(|e| {
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Listing task failed: {}", e),
            )
        })??;
    Ok(ok(dates))
}
