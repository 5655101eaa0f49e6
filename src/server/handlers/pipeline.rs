//! Pipeline control, progress and log handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::helpers::{ok, ok_with_message, ApiError, ApiResult};
use super::super::AppState;
use crate::logging::{LogEntry, LogLevel};
use crate::models::Item;
use crate::pipeline::{
    summarize, PipelineController, PipelineError, PipelineServices, PipelineState, Progress,
    ResultProcessor, StopPolicy,
};

#[derive(Debug, Serialize)]
pub struct PipelineView {
    pub progress: Progress,
    pub state: PipelineState,
}

impl PipelineView {
    fn of(controller: &PipelineController) -> Self {
        let state = controller.snapshot();
        Self {
            progress: summarize(&state),
            state: PipelineState::clone(&state),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Items to process; defaults to the last upload.
    pub items: Option<Vec<Item>>,
    pub chunk_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub stop_policy: Option<StopPolicy>,
}

/// Create a fresh pipeline, stopping any previous one.
pub async fn init(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> ApiResult<PipelineView> {
    let items = match request.items {
        Some(items) => items,
        None => state.items.read().await.clone(),
    };
    if items.is_empty() {
        return Err(ApiError::bad_request(
            "No items to process; upload a CSV first",
        ));
    }

    let mut options = state.settings.pipeline_options();
    if let Some(size) = request.chunk_size {
        options.chunk_size = size;
    }
    if let Some(limit) = request.concurrency {
        options.concurrency = limit;
    }
    if let Some(policy) = request.stop_policy {
        options.stop_policy = policy;
    }

    let results: Arc<dyn ResultProcessor> = state.results.clone();
    let services = PipelineServices {
        service: state.service.clone(),
        assembler: state.assembler.clone(),
        results,
        logger: state.logger.clone(),
    };

    let mut slot = state.pipeline.lock().await;
    if let Some(previous) = slot.take() {
        state
            .logger
            .info("PIPELINE", "Replacing existing pipeline; stopping it first");
        if let Err(e) = previous.stop().await {
            state
                .logger
                .warn("PIPELINE", format!("Previous pipeline did not stop cleanly: {}", e));
        }
    }

    let controller = PipelineController::initialize(items, options, services)?;
    let view = PipelineView::of(&controller);
    *slot = Some(controller);

    Ok(ok_with_message("Pipeline initialized", view))
}

async fn current(state: &AppState) -> Result<PipelineController, ApiError> {
    state
        .pipeline
        .lock()
        .await
        .clone()
        .ok_or_else(|| PipelineError::NotInitialized.into())
}

pub async fn status(State(state): State<AppState>) -> ApiResult<PipelineView> {
    let controller = current(&state).await?;
    Ok(ok(PipelineView::of(&controller)))
}

pub async fn start(State(state): State<AppState>) -> ApiResult<PipelineView> {
    let controller = current(&state).await?;
    controller.start().await?;
    Ok(ok_with_message("Pipeline started", PipelineView::of(&controller)))
}

pub async fn pause(State(state): State<AppState>) -> ApiResult<PipelineView> {
    let controller = current(&state).await?;
    controller.pause().await?;
    Ok(ok_with_message("Pipeline paused", PipelineView::of(&controller)))
}

pub async fn resume(State(state): State<AppState>) -> ApiResult<PipelineView> {
    let controller = current(&state).await?;
    controller.resume().await?;
    Ok(ok_with_message("Pipeline resumed", PipelineView::of(&controller)))
}

pub async fn stop(State(state): State<AppState>) -> ApiResult<PipelineView> {
    let controller = current(&state).await?;
    controller.stop().await?;
    Ok(ok_with_message("Pipeline stopped", PipelineView::of(&controller)))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

/// Recent log entries, oldest first.
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Vec<LogEntry>> {
    let level = match query.level.as_deref() {
        Some(raw) => raw.parse::<LogLevel>().map_err(ApiError::bad_request)?,
        None => LogLevel::Debug,
    };
    let mut entries = state
        .log_sink
        .filtered(level, query.category.as_deref().filter(|c| !c.is_empty()));

    if let Some(limit) = query.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }
    Ok(ok(entries))
}
