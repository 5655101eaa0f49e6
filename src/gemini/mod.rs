//! Remote job client for the Gemini Batch API.
//!
//! The pipeline only depends on the [`BatchJobService`] trait; the HTTP
//! implementation lives in [`client`].

mod client;
mod error;
mod retry;
mod types;

pub use client::{
    api_key_from_env, GeminiBatchClient, GeminiClientConfig, DEFAULT_BASE_URL, DEFAULT_MODEL,
};
pub use error::GeminiError;
pub use retry::{backoff_delay, parse_retry_after};
pub use types::{BatchRequest, Content, GenerateRequest, InlineData, JobHandle, JobState, JobStatus, Part};

use async_trait::async_trait;

/// Asynchronous batch job service.
///
/// Submission uploads the payload and creates the job in one call; the
/// returned status carries the job handle.
#[async_trait]
pub trait BatchJobService: Send + Sync {
    /// Upload `jsonl` and create a batch job named `display_name`.
    async fn submit(&self, display_name: &str, jsonl: &str) -> Result<JobStatus, GeminiError>;

    async fn get_status(&self, job: &JobHandle) -> Result<JobStatus, GeminiError>;

    /// Download a result file by name (`files/...`).
    async fn download(&self, file_name: &str) -> Result<String, GeminiError>;

    async fn cancel(&self, job: &JobHandle) -> Result<(), GeminiError>;

    async fn delete(&self, job: &JobHandle) -> Result<(), GeminiError>;
}
