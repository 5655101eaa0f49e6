//! Wire types for the Gemini Batch API and the normalised job status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a remote batch job (e.g. `batches/abc123`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Full resource name as returned by the API.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bare id with any `batches/` prefix removed.
    pub fn id(&self) -> &str {
        self.0.strip_prefix("batches/").unwrap_or(&self.0)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote job state vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
    Unknown(String),
}

impl JobState {
    /// Parse either `JOB_STATE_*` or `BATCH_STATE_*` names.
    pub fn parse(raw: &str) -> Self {
        let name = raw
            .strip_prefix("JOB_STATE_")
            .or_else(|| raw.strip_prefix("BATCH_STATE_"))
            .unwrap_or(raw);
        match name {
            "PENDING" | "QUEUED" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "SUCCEEDED" => JobState::Succeeded,
            "FAILED" => JobState::Failed,
            "CANCELLED" => JobState::Cancelled,
            "EXPIRED" => JobState::Expired,
            _ => JobState::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "JOB_STATE_PENDING",
            JobState::Running => "JOB_STATE_RUNNING",
            JobState::Succeeded => "JOB_STATE_SUCCEEDED",
            JobState::Failed => "JOB_STATE_FAILED",
            JobState::Cancelled => "JOB_STATE_CANCELLED",
            JobState::Expired => "JOB_STATE_EXPIRED",
            JobState::Unknown(raw) => raw,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }

    /// Failed, cancelled, or expired.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Cancelled | JobState::Expired
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// Lowercase label without prefix, e.g. `cancelled`.
    pub fn label(&self) -> String {
        self.as_str()
            .trim_start_matches("JOB_STATE_")
            .to_lowercase()
    }
}

impl From<String> for JobState {
    fn from(s: String) -> Self {
        JobState::parse(&s)
    }
}

impl From<JobState> for String {
    fn from(s: JobState) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised status of a remote batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub batch_id: String,
    pub display_name: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub completed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    /// Result file name (`files/...`), set once the job succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl JobStatus {
    /// Minimal status for a job in the given state.
    pub fn new(batch_id: impl Into<String>, state: JobState) -> Self {
        Self {
            batch_id: batch_id.into(),
            display_name: String::new(),
            state,
            create_time: None,
            update_time: None,
            end_time: None,
            request_count: 0,
            completed_count: 0,
            failed_count: 0,
            output_file: None,
            error: None,
            done: false,
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle::new(self.batch_id.clone())
    }

    /// Human-readable reason for a failed/cancelled/expired job.
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(detail) if !detail.is_empty() => {
                format!("Batch {}: {}", self.state.label(), detail)
            }
            _ => format!("Batch {}", self.state.label()),
        }
    }

    /// Build from a raw `batches/<id>` or operation response.
    pub(crate) fn from_operation(op: BatchOperation, fallback_id: &str) -> Self {
        let metadata = op.metadata.unwrap_or_default();
        let stats = metadata.batch_stats.unwrap_or_default();
        let output = metadata.output.or(op.response).unwrap_or_default();
        let state = metadata
            .state
            .as_deref()
            .map(JobState::parse)
            .unwrap_or_else(|| JobState::Unknown("JOB_STATE_UNKNOWN".to_string()));

        Self {
            batch_id: op
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| fallback_id.to_string()),
            display_name: metadata
                .display_name
                .unwrap_or_else(|| "Batch Job".to_string()),
            state,
            create_time: metadata.create_time,
            update_time: metadata.update_time,
            end_time: metadata.end_time,
            request_count: count_value(stats.request_count.as_ref()),
            completed_count: count_value(stats.successful_request_count.as_ref()),
            failed_count: count_value(stats.failed_request_count.as_ref()),
            output_file: output.responses_file,
            error: op.error.map(|e| error_message(&e)),
            done: op.done.unwrap_or(false),
        }
    }
}

/// The API reports counts as decimal strings; accept numbers too.
fn count_value(value: Option<&serde_json::Value>) -> u64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn error_message(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Request payload
// ---------------------------------------------------------------------------

/// One line of the batch input JSONL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub key: String,
    pub request: GenerateRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl BatchRequest {
    pub fn new(key: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            key: key.into(),
            request: GenerateRequest {
                contents: vec![Content { parts }],
            },
        }
    }

    pub fn has_image(&self) -> bool {
        self.request
            .contents
            .iter()
            .flat_map(|c| c.parts.iter())
            .any(|p| matches!(p, Part::InlineData { .. }))
    }
}

// ---------------------------------------------------------------------------
// Raw API responses
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BatchOperation {
    pub name: Option<String>,
    pub metadata: Option<BatchMetadata>,
    pub response: Option<BatchOutput>,
    pub error: Option<serde_json::Value>,
    pub done: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchMetadata {
    pub state: Option<String>,
    pub display_name: Option<String>,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
    pub end_time: Option<String>,
    pub batch_stats: Option<BatchStats>,
    pub output: Option<BatchOutput>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchStats {
    pub request_count: Option<serde_json::Value>,
    pub successful_request_count: Option<serde_json::Value>,
    pub failed_request_count: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchOutput {
    pub responses_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadResponse {
    pub file: UploadedFile,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadedFile {
    pub name: String,
}
