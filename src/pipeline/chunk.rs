//! Chunks and the per-chunk state machine.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::PipelineError;
use crate::gemini::{JobHandle, JobStatus};
use crate::models::Item;

/// Lifecycle status of a chunk.
///
/// ```text
/// pending -> preparing -> submitted -> processing -> downloading_results -> completed
///               |             |            |
///               +-> failed    +-> failed   +-> failed
/// ```
///
/// `submitted -> downloading_results` is allowed when the first observed
/// status is already a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    /// Source images are being fetched and the payload assembled.
    Preparing,
    Submitted,
    Processing,
    DownloadingResults,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }

    /// Admitted and not yet terminal.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != ChunkStatus::Pending
    }

    /// Whether a chunk in this status must carry a job handle.
    pub fn requires_job(self) -> bool {
        matches!(
            self,
            ChunkStatus::Submitted
                | ChunkStatus::Processing
                | ChunkStatus::DownloadingResults
                | ChunkStatus::Completed
        )
    }

    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Preparing, Submitted)
                | (Preparing, Failed)
                | (Submitted, Processing)
                | (Submitted, DownloadingResults)
                | (Submitted, Failed)
                | (Processing, DownloadingResults)
                | (Processing, Failed)
                | (DownloadingResults, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Preparing => "preparing",
            ChunkStatus::Submitted => "submitted",
            ChunkStatus::Processing => "processing",
            ChunkStatus::DownloadingResults => "downloading_results",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of local result processing for a chunk whose remote job succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    pub image_count: usize,
    /// Per-item extraction problems.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Set when download or extraction failed as a whole.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
}

impl ResultMeta {
    pub fn degraded(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A contiguous slice of items processed as one remote batch job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    #[serde(rename = "itemCount", serialize_with = "serialize_len")]
    pub items: Arc<Vec<Item>>,
    pub status: ChunkStatus,
    #[serde(rename = "jobHandle", skip_serializing_if = "Option::is_none")]
    pub job: Option<JobHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_snapshot: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_meta: Option<ResultMeta>,
}

fn serialize_len<S: Serializer>(items: &Arc<Vec<Item>>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(items.len() as u64)
}

impl Chunk {
    pub fn new(index: usize, items: Vec<Item>) -> Self {
        Self {
            index,
            items: Arc::new(items),
            status: ChunkStatus::Pending,
            job: None,
            job_snapshot: None,
            start_time: None,
            end_time: None,
            error: None,
            result_meta: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Move to `next`, maintaining timestamps. Rejects transitions outside
    /// the state machine.
    pub(crate) fn transition(
        &mut self,
        next: ChunkStatus,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                index: self.index,
                from: self.status,
                to: next,
            });
        }
        if next == ChunkStatus::Preparing {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// Partition `items` into consecutive chunks of `chunk_size`; the last chunk
/// holds the remainder.
pub fn split_into_chunks(items: Vec<Item>, chunk_size: usize) -> Result<Vec<Chunk>, PipelineError> {
    if chunk_size == 0 {
        return Err(PipelineError::InvalidChunkSize);
    }
    if items.is_empty() {
        return Err(PipelineError::EmptyItems);
    }

    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut rest = items.into_iter().peekable();
    while rest.peek().is_some() {
        let slice: Vec<Item> = rest.by_ref().take(chunk_size).collect();
        chunks.push(Chunk::new(chunks.len(), slice));
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<Item> {
        (0..n).map(|i| Item::new(i.to_string(), "p")).collect()
    }

    #[test]
    fn test_split_reproduces_input() {
        for (n, k) in [(1, 1), (7, 3), (75, 75), (203, 75), (10, 100)] {
            let input = items(n);
            let chunks = split_into_chunks(input.clone(), k).unwrap();

            assert_eq!(chunks.len(), n.div_ceil(k));
            let rebuilt: Vec<Item> = chunks
                .iter()
                .flat_map(|c| c.items.iter().cloned())
                .collect();
            assert_eq!(rebuilt, input);

            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i);
                if i + 1 < chunks.len() {
                    assert_eq!(chunk.len(), k);
                } else {
                    assert!(chunk.len() >= 1 && chunk.len() <= k);
                }
            }
        }
    }

    #[test]
    fn test_split_203_by_75() {
        let sizes: Vec<usize> = split_into_chunks(items(203), 75)
            .unwrap()
            .iter()
            .map(Chunk::len)
            .collect();
        assert_eq!(sizes, vec![75, 75, 53]);
    }

    #[test]
    fn test_split_rejects_bad_input() {
        assert!(matches!(
            split_into_chunks(items(3), 0),
            Err(PipelineError::InvalidChunkSize)
        ));
        assert!(matches!(
            split_into_chunks(Vec::new(), 5),
            Err(PipelineError::EmptyItems)
        ));
    }

    #[test]
    fn test_transition_table() {
        use ChunkStatus::*;
        assert!(Pending.can_transition_to(Preparing));
        assert!(Submitted.can_transition_to(DownloadingResults));
        assert!(!Pending.can_transition_to(Submitted));
        assert!(!DownloadingResults.can_transition_to(Failed));
        for terminal in [Completed, Failed] {
            for next in [Pending, Preparing, Submitted, Processing, DownloadingResults, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut chunk = Chunk::new(0, items(1));
        let t0 = Utc::now();
        chunk.transition(ChunkStatus::Preparing, t0).unwrap();
        assert_eq!(chunk.start_time, Some(t0));

        let t1 = t0 + chrono::Duration::seconds(5);
        chunk.transition(ChunkStatus::Failed, t1).unwrap();
        assert_eq!(chunk.end_time, Some(t1));

        let err = chunk.transition(ChunkStatus::Preparing, t1).unwrap_err();
        assert!(matches!(err, PipelineError::IllegalTransition { .. }));
    }

    #[test]
    fn test_chunk_serializes_item_count() {
        let chunk = Chunk::new(2, items(4));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["itemCount"], 4);
        assert_eq!(json["status"], "pending");
        assert!(json.get("jobHandle").is_none());
    }
}
