use thiserror::Error;

use super::chunk::ChunkStatus;
use super::state::RunState;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Chunk size must be positive")]
    InvalidChunkSize,
    #[error("Concurrency limit must be positive")]
    InvalidConcurrency,
    #[error("Cannot build a pipeline from an empty item set")]
    EmptyItems,
    #[error("Chunk {index} does not exist")]
    UnknownChunk { index: usize },
    #[error("Chunk {index}: illegal transition {from} -> {to}")]
    IllegalTransition {
        index: usize,
        from: ChunkStatus,
        to: ChunkStatus,
    },
    #[error("Chunk {index} cannot be admitted: {reason}")]
    AdmissionRejected { index: usize, reason: String },
    #[error("Cannot {action} a pipeline that is {state}")]
    InvalidRunState {
        action: &'static str,
        state: RunState,
    },
    #[error("Pipeline not initialized")]
    NotInitialized,
    #[error("Pipeline driver has shut down")]
    DriverGone,
}
