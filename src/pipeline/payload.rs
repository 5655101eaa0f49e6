//! Batch payload assembly.
//!
//! Each item becomes one JSONL request line: the prompt text plus, when
//! enabled, the source image inlined as base64. Image problems only degrade
//! the affected request to text-only.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::gemini::{BatchRequest, InlineData, Part};
use crate::logging::PipelineLogger;
use crate::models::Item;

/// Appended to every prompt so the product is blended into the scene.
pub const SCENE_INSTRUCTIONS: &str = "Ensure seamless integration and harmonious blending of the rug within the scene so it appears naturally part of the environment, not artificially placed or pasted on. Avoid low quality, overexposed, watermarks, extra rugs, distorted perspective, cartoon style, text, logos, blurry elements, or graininess.\n\nUsing the rug image provided above, generate a photorealistic interior scene image that matches these exact requirements. The generated image must show the EXACT rug from the provided image placed in the scene as described.";

const IMAGE_FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("No batch requests generated")]
    Empty,
    #[error("Failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Requests for one chunk, ready to upload.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub requests: Vec<BatchRequest>,
    /// Item keys whose image could not be embedded.
    pub degraded: Vec<String>,
}

impl Payload {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// One JSON object per line.
    pub fn to_jsonl(&self) -> Result<String, AssemblyError> {
        let lines = self
            .requests
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines.join("\n"))
    }
}

/// Builds the upload payload for a chunk's items.
#[async_trait]
pub trait PayloadAssembler: Send + Sync {
    /// Must return a non-empty payload or an error for the whole chunk.
    async fn assemble(&self, chunk_index: usize, items: &[Item]) -> Result<Payload, AssemblyError>;
}

#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    pub include_images: bool,
    pub image_timeout: Duration,
    pub max_image_bytes: usize,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            include_images: true,
            image_timeout: Duration::from_secs(30),
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Assembler that downloads source images over HTTP.
#[derive(Clone)]
pub struct ImagePayloadAssembler {
    http: reqwest::Client,
    options: AssemblerOptions,
    logger: PipelineLogger,
}

impl ImagePayloadAssembler {
    pub fn new(options: AssemblerOptions, logger: PipelineLogger) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(options.image_timeout)
            .user_agent("Mozilla/5.0 (compatible; rugbatch/0.1)")
            .build()?;
        Ok(Self {
            http,
            options,
            logger,
        })
    }

    /// Download an image and return `(mime_type, base64)`.
    async fn fetch_image(&self, url: &str) -> Result<(String, String), String> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        if !mime_type.starts_with("image/") {
            return Err(format!("not an image (content-type '{}')", mime_type));
        }

        let limit = self.options.max_image_bytes;
        if let Some(length) = response.content_length() {
            if length as usize > limit {
                return Err(format!("image too large ({} bytes)", length));
            }
        }

        // Bodies without a Content-Length are capped while streaming.
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| format!("read failed: {}", e))?
        {
            if bytes.len() + chunk.len() > limit {
                return Err(format!("image too large (over {} bytes)", limit));
            }
            bytes.extend_from_slice(&chunk);
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok((mime_type, encoded))
    }

    async fn build_request(&self, chunk_index: usize, item: &Item) -> (BatchRequest, bool) {
        let mut parts = vec![Part::Text {
            text: request_text(item),
        }];
        let mut degraded = false;

        if self.options.include_images {
            if let Some(url) = item.image_url.as_deref() {
                match self.fetch_image(url).await {
                    Ok((mime_type, data)) => parts.push(Part::InlineData {
                        inline_data: InlineData { mime_type, data },
                    }),
                    Err(reason) => {
                        degraded = true;
                        self.logger.chunk(chunk_index).warn(
                            "IMAGE",
                            format!("{}: image skipped ({}): {}", item.key, reason, url),
                        );
                    }
                }
            }
        }

        (BatchRequest::new(item.request_key(), parts), degraded)
    }
}

#[async_trait]
impl PayloadAssembler for ImagePayloadAssembler {
    async fn assemble(&self, chunk_index: usize, items: &[Item]) -> Result<Payload, AssemblyError> {
        let pending: Vec<_> = items
            .iter()
            .map(|item| self.build_request(chunk_index, item))
            .collect();
        let built: Vec<(BatchRequest, bool)> = stream::iter(pending)
            .buffered(IMAGE_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut payload = Payload::default();
        for ((request, degraded), item) in built.into_iter().zip(items) {
            if degraded {
                payload.degraded.push(item.key.clone());
            }
            payload.requests.push(request);
        }

        if payload.is_empty() {
            return Err(AssemblyError::Empty);
        }
        self.logger.chunk(chunk_index).info(
            "PAYLOAD",
            format!(
                "Generated {} batch requests ({} without image)",
                payload.len(),
                payload.degraded.len()
            ),
        );
        Ok(payload)
    }
}

/// Prompt text sent for an item.
pub fn request_text(item: &Item) -> String {
    format!("{} {}", item.prompt.trim(), SCENE_INSTRUCTIONS)
}
