//! Extraction of generated images from batch result JSONL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use super::ResultsError;
use crate::logging::PipelineLogger;
use crate::models::Item;
use crate::pipeline::{ResultMeta, ResultProcessor};

/// One decoded image.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub key: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ExtractedImage {
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", sanitize_file_stem(&self.key), self.extension())
    }
}

/// Images found in a result file plus per-line problems.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub total_lines: usize,
    pub images: Vec<ExtractedImage>,
    pub errors: Vec<String>,
}

/// Parse result JSONL and decode the first inline image of each line.
///
/// Keys come from the line's `key`, else `fallback_keys[i]`, else
/// `rug-idx-<chunk>-<i>`. Problems with individual lines are reported in
/// `errors`; this never fails as a whole.
pub fn extract_images(jsonl: &str, fallback_keys: &[String], chunk_index: usize) -> Extraction {
    let mut extraction = Extraction::default();

    for (i, line) in jsonl.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        extraction.total_lines += 1;

        let result: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                extraction
                    .errors
                    .push(format!("Line {}: Parse error - {}", i + 1, e));
                continue;
            }
        };

        let key = result
            .get("key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| fallback_keys.get(i).cloned())
            .unwrap_or_else(|| format!("rug-idx-{}-{}", chunk_index, i));

        if let Some(error) = result.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            extraction
                .errors
                .push(format!("{}: API error - {}", key, message));
            continue;
        }

        let parts = match result
            .pointer("/response/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            Some(parts) => parts,
            None => {
                let reason = if result
                    .pointer("/response/candidates/0")
                    .is_some()
                {
                    "No parts in response"
                } else {
                    "No candidates in response"
                };
                extraction.errors.push(format!("{}: {}", key, reason));
                continue;
            }
        };

        let inline = parts
            .iter()
            .find_map(|p| p.get("inlineData").or_else(|| p.get("inline_data")));

        match inline {
            Some(inline) => {
                let data = inline.get("data").and_then(Value::as_str).unwrap_or("");
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string();
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) if !bytes.is_empty() => extraction.images.push(ExtractedImage {
                        key,
                        mime_type,
                        data: bytes,
                    }),
                    Ok(_) => extraction
                        .errors
                        .push(format!("{}: Empty image data", key)),
                    Err(e) => extraction
                        .errors
                        .push(format!("{}: Invalid base64 - {}", key, e)),
                }
            }
            None if parts.iter().any(|p| p.get("text").is_some()) => {
                extraction
                    .errors
                    .push(format!("{}: Text-only response", key));
            }
            None => extraction
                .errors
                .push(format!("{}: No image data found", key)),
        }
    }

    extraction
}

/// Keep keys usable as file names.
pub fn sanitize_file_stem(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Where a chunk's results were written.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedResults {
    pub jsonl_path: PathBuf,
    pub images_dir: PathBuf,
    pub total_results: usize,
    pub extracted_images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Writes result files under `<output>/<YYYY-MM-DD>/{jsonl,images}`.
#[derive(Clone)]
pub struct ResultStore {
    output_dir: PathBuf,
    logger: PipelineLogger,
}

impl ResultStore {
    pub fn new(output_dir: impl Into<PathBuf>, logger: PipelineLogger) -> Self {
        Self {
            output_dir: output_dir.into(),
            logger,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Today's dated folder.
    pub fn date_dir(&self) -> PathBuf {
        self.output_dir
            .join(Utc::now().format("%Y-%m-%d").to_string())
    }

    /// Persist a chunk's raw results and extracted images.
    pub async fn save_and_extract(
        &self,
        chunk_index: usize,
        content: &str,
        fallback_keys: &[String],
    ) -> Result<SavedResults, ResultsError> {
        self.save_into(&self.date_dir(), chunk_index, content, fallback_keys)
            .await
    }

    pub(crate) async fn save_into(
        &self,
        base_dir: &Path,
        chunk_index: usize,
        content: &str,
        fallback_keys: &[String],
    ) -> Result<SavedResults, ResultsError> {
        let jsonl_dir = base_dir.join("jsonl");
        let images_dir = base_dir.join("images");
        tokio::fs::create_dir_all(&jsonl_dir).await?;
        tokio::fs::create_dir_all(&images_dir).await?;

        let jsonl_path = jsonl_dir.join(format!("batch-results-chunk-{}.jsonl", chunk_index + 1));
        tokio::fs::write(&jsonl_path, content).await?;

        let extraction = extract_images(content, fallback_keys, chunk_index);
        let mut saved = Vec::with_capacity(extraction.images.len());
        for image in &extraction.images {
            let file_name = image.file_name();
            tokio::fs::write(images_dir.join(&file_name), &image.data).await?;
            saved.push(file_name);
        }

        self.logger.chunk(chunk_index).info(
            "RESULTS",
            format!(
                "Saved {} images, {} errors to {}",
                saved.len(),
                extraction.errors.len(),
                base_dir.display()
            ),
        );

        Ok(SavedResults {
            jsonl_path,
            images_dir,
            total_results: extraction.total_lines,
            extracted_images: saved,
            errors: extraction.errors,
        })
    }
}

#[async_trait]
impl ResultProcessor for ResultStore {
    async fn process(
        &self,
        chunk_index: usize,
        items: &[Item],
        content: &str,
    ) -> Result<ResultMeta, String> {
        let keys: Vec<String> = items.iter().map(Item::request_key).collect();
        let saved = self
            .save_and_extract(chunk_index, content, &keys)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ResultMeta {
            image_count: saved.extracted_images.len(),
            errors: saved.errors,
            error: None,
            saved_path: Some(saved.jsonl_path.display().to_string()),
        })
    }
}
