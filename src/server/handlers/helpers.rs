//! Shared response types for handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::gemini::GeminiError;
use crate::pipeline::PipelineError;
use crate::results::ResultsError;

/// Error returned by API handlers as `{"success": false, "error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = json!(details);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<GeminiError> for ApiError {
    fn from(e: GeminiError) -> Self {
        match e {
            GeminiError::MissingApiKey => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Gemini API key not configured",
            ),
            GeminiError::Api { status, body } => {
                Self::new(StatusCode::BAD_GATEWAY, format!("Gemini API error ({})", status))
                    .with_details(body)
            }
            GeminiError::RateLimited { .. } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string())
            }
            other => Self::new(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InvalidRunState { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            PipelineError::NotInitialized => Self::not_found(e.to_string()),
            PipelineError::DriverGone => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<ResultsError> for ApiError {
    fn from(e: ResultsError) -> Self {
        match e {
            ResultsError::InvalidDate(_) => Self::bad_request(e.to_string()),
            ResultsError::NotFound(_) => Self::not_found(e.to_string()),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

/// Successful response wrapper: `{"success": true, "data": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        message: None,
        data,
    })
}

pub fn ok_with_message<T: Serialize>(message: impl Into<String>, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        message: Some(message.into()),
        data,
    })
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;
