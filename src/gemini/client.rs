//! HTTP client for the Gemini Batch API.
//!
//! Features:
//! - JSONL upload through the Files API (multipart upload protocol)
//! - Batch creation, status, cancel and delete
//! - Result file download
//! - Automatically retries on 429 with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use super::retry::{backoff_delay, parse_retry_after};
use super::types::{BatchOperation, JobHandle, JobStatus, UploadResponse};
use super::{BatchJobService, GeminiError};

/// Default Gemini API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
/// Default image generation model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";
/// Maximum retry attempts on rate limit errors.
const MAX_RETRIES: u32 = 5;

/// Connection settings for the batch client.
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// Base delay for 429 backoff when no Retry-After header is sent.
    pub retry_base_ms: u64,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            api_key: api_key_from_env(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
            max_retries: MAX_RETRIES,
            retry_base_ms: 1000,
        }
    }
}

/// Read the API key from `GEMINI_API_KEY`, then `GOOGLE_GENERATIVE_AI_API_KEY`.
pub fn api_key_from_env() -> Option<String> {
    ["GEMINI_API_KEY", "GOOGLE_GENERATIVE_AI_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|v| !v.trim().is_empty())
}

/// Gemini Batch API client.
#[derive(Clone)]
pub struct GeminiBatchClient {
    http: Client,
    config: GeminiClientConfig,
}

impl GeminiBatchClient {
    pub fn new(config: GeminiClientConfig) -> Result<Self, GeminiError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("rugbatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GeminiClientConfig {
        &self.config
    }

    pub fn has_api_key(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn api_key(&self) -> Result<&str, GeminiError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(GeminiError::MissingApiKey)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Send a request, retrying on 429 and mapping non-2xx to `GeminiError::Api`.
    ///
    /// `build` is invoked once per attempt since request bodies (multipart in
    /// particular) cannot be replayed.
    async fn send<F>(&self, build: F) -> Result<Response, GeminiError>
    where
        F: Fn() -> Result<RequestBuilder, GeminiError>,
    {
        let mut attempt = 0;
        loop {
            let response = build()?.send().await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.config.max_retries {
                    return Err(GeminiError::RateLimited {
                        attempts: attempt + 1,
                    });
                }
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                let wait = parse_retry_after(retry_after)
                    .unwrap_or_else(|| backoff_delay(attempt, self.config.retry_base_ms));

                warn!(
                    "Gemini rate limited (attempt {}), waiting {:?}",
                    attempt + 1,
                    wait
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(GeminiError::Api { status, body });
            }

            return Ok(response);
        }
    }

    /// Upload JSONL content and return the stored file name (`files/...`).
    pub async fn upload_jsonl(
        &self,
        display_name: &str,
        jsonl: &str,
    ) -> Result<String, GeminiError> {
        let key = self.api_key()?;
        let url = self.url("upload/v1beta/files");
        let metadata = json!({
            "file": {
                "display_name": display_name,
                "mime_type": "application/jsonl",
            }
        })
        .to_string();

        debug!("Uploading {} bytes as {}", jsonl.len(), display_name);

        let response = self
            .send(|| {
                let form = Form::new()
                    .part(
                        "metadata",
                        Part::text(metadata.clone()).mime_str("application/json")?,
                    )
                    .part(
                        "data",
                        Part::bytes(jsonl.as_bytes().to_vec())
                            .file_name(format!("{}.jsonl", display_name))
                            .mime_str("application/jsonl")?,
                    );
                Ok(self
                    .http
                    .post(&url)
                    .query(&[("key", key)])
                    .header("X-Goog-Upload-Protocol", "multipart")
                    .multipart(form))
            })
            .await?;

        let body = response.text().await?;
        let uploaded: UploadResponse = serde_json::from_str(&body)?;
        Ok(uploaded.file.name)
    }

    /// Create a batch job over a previously uploaded file.
    pub async fn create_batch(
        &self,
        file_name: &str,
        display_name: &str,
    ) -> Result<JobStatus, GeminiError> {
        let key = self.api_key()?;
        let url = self.url(&format!(
            "v1beta/models/{}:batchGenerateContent",
            self.config.model
        ));
        let body = json!({
            "batch": {
                "display_name": display_name,
                "input_config": { "file_name": file_name },
            }
        });

        let response = self
            .send(|| Ok(self.http.post(&url).query(&[("key", key)]).json(&body)))
            .await?;
        let text = response.text().await?;
        let op: BatchOperation = serde_json::from_str(&text)?;
        if op.name.as_deref().map_or(true, str::is_empty) {
            return Err(GeminiError::UnexpectedResponse(format!(
                "batch creation returned no name: {}",
                text
            )));
        }

        let mut status = JobStatus::from_operation(op, "");
        if status.display_name == "Batch Job" {
            status.display_name = display_name.to_string();
        }
        Ok(status)
    }

    /// Fetch the current status of a batch job.
    pub async fn get_batch(&self, job: &JobHandle) -> Result<JobStatus, GeminiError> {
        let key = self.api_key()?;
        let url = self.url(&format!("v1beta/batches/{}", urlencoding::encode(job.id())));

        let response = self
            .send(|| Ok(self.http.get(&url).query(&[("key", key)])))
            .await?;
        let op: BatchOperation = serde_json::from_str(&response.text().await?)?;
        Ok(JobStatus::from_operation(op, job.as_str()))
    }

    /// Download a result file as text.
    pub async fn download_file(&self, file_name: &str) -> Result<String, GeminiError> {
        let key = self.api_key()?;
        let url = self.url(&format!("download/v1beta/{}:download", file_name));

        let response = self
            .send(|| {
                Ok(self
                    .http
                    .get(&url)
                    .query(&[("alt", "media"), ("key", key)]))
            })
            .await?;
        Ok(response.text().await?)
    }

    pub async fn cancel_batch(&self, job: &JobHandle) -> Result<(), GeminiError> {
        let key = self.api_key()?;
        let url = self.url(&format!(
            "v1beta/batches/{}:cancel",
            urlencoding::encode(job.id())
        ));
        self.send(|| Ok(self.http.post(&url).query(&[("key", key)])))
            .await?;
        Ok(())
    }

    pub async fn delete_batch(&self, job: &JobHandle) -> Result<(), GeminiError> {
        let key = self.api_key()?;
        let url = self.url(&format!("v1beta/batches/{}", urlencoding::encode(job.id())));
        self.send(|| Ok(self.http.delete(&url).query(&[("key", key)])))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchJobService for GeminiBatchClient {
    async fn submit(&self, display_name: &str, jsonl: &str) -> Result<JobStatus, GeminiError> {
        let file_name = self.upload_jsonl(display_name, jsonl).await?;
        debug!("Uploaded {} as {}", display_name, file_name);
        self.create_batch(&file_name, display_name).await
    }

    async fn get_status(&self, job: &JobHandle) -> Result<JobStatus, GeminiError> {
        self.get_batch(job).await
    }

    async fn download(&self, file_name: &str) -> Result<String, GeminiError> {
        self.download_file(file_name).await
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), GeminiError> {
        self.cancel_batch(job).await
    }

    async fn delete(&self, job: &JobHandle) -> Result<(), GeminiError> {
        self.delete_batch(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn spawn_fake_api() -> String {
        let app = Router::new()
            .route(
                "/upload/v1beta/files",
                post(|| async { Json(json!({"file": {"name": "files/input-1"}})) }),
            )
            .route(
                "/v1beta/models/:model",
                post(|Path(model): Path<String>| async move {
                    assert!(model.ends_with(":batchGenerateContent"));
                    Json(json!({
                        "name": "batches/job-1",
                        "metadata": {"state": "BATCH_STATE_PENDING", "displayName": "chunk"}
                    }))
                }),
            )
            .route(
                "/v1beta/batches/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({
                        "name": format!("batches/{}", id),
                        "metadata": {
                            "state": "BATCH_STATE_SUCCEEDED",
                            "output": {"responsesFile": "files/out-1"}
                        },
                        "done": true
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn test_client(base_url: String) -> GeminiBatchClient {
        GeminiBatchClient::new(GeminiClientConfig {
            api_key: Some("test-key".to_string()),
            base_url,
            ..GeminiClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_poll_against_fake_api() {
        let client = test_client(spawn_fake_api().await);

        let status = client.submit("chunk", "{}\n").await.unwrap();
        assert_eq!(status.batch_id, "batches/job-1");
        assert_eq!(status.display_name, "chunk");

        let polled = client.get_status(&status.handle()).await.unwrap();
        assert!(polled.state.is_success());
        assert_eq!(polled.output_file.as_deref(), Some("files/out-1"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = GeminiBatchClient::new(GeminiClientConfig {
            api_key: None,
            ..GeminiClientConfig::default()
        })
        .unwrap();

        let err = client
            .get_status(&JobHandle::new("batches/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GeminiError::MissingApiKey));
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_body() {
        let app = Router::new().route(
            "/v1beta/batches/:id",
            get(|| async { (StatusCode::NOT_FOUND, "no such batch") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = test_client(format!("http://{}", addr));
        let err = client
            .get_status(&JobHandle::new("batches/missing"))
            .await
            .unwrap_err();

        match err {
            GeminiError::Api { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such batch");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
