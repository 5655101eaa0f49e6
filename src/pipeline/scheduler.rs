//! Admission decisions.

use super::chunk::ChunkStatus;
use super::state::PipelineState;

/// Pending chunk indices that may start now, lowest index first, bounded by
/// the free concurrency slots. Does not mutate `state`.
pub fn admit_next(state: &PipelineState) -> Vec<usize> {
    let available = state.free_slots();
    if available == 0 {
        return Vec::new();
    }

    state
        .chunks
        .iter()
        .filter(|c| c.status == ChunkStatus::Pending)
        .map(|c| c.index)
        .take(available)
        .collect()
}
