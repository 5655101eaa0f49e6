//! Remote job client error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("Gemini API key not configured (set GEMINI_API_KEY or GOOGLE_GENERATIVE_AI_API_KEY)")]
    MissingApiKey,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gemini API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl GeminiError {
    /// Whether a retry on the next poll tick could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GeminiError::Http(_) | GeminiError::RateLimited { .. } => true,
            GeminiError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
