//! Progress summary derived from pipeline state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::{PipelineState, RunState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    pub pending_chunks: usize,
    /// In-flight chunk indices, ascending.
    pub processing_chunks: Vec<usize>,
    /// Chunks left non-terminal by a stop.
    pub interrupted_chunks: usize,
    /// 0..=100
    pub overall_progress: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_ms: Option<u64>,
    pub current_status: String,
    pub run_state: RunState,
}

impl Progress {
    pub fn eta_display(&self) -> Option<String> {
        self.estimated_time_remaining_ms.map(format_time_remaining)
    }
}

/// Summarize `state` as of now.
pub fn summarize(state: &PipelineState) -> Progress {
    summarize_at(state, Utc::now())
}

/// Summarize `state` as of `now`.
pub fn summarize_at(state: &PipelineState, now: DateTime<Utc>) -> Progress {
    let total = state.total();
    let completed = state.completed_count;
    let failed = state.failed_count;
    let pending = state.pending_count();
    let processing: Vec<usize> = state.in_flight.iter().copied().collect();

    let overall_progress = if total > 0 {
        ((completed + failed) as f64 / total as f64 * 100.0).round() as u32
    } else {
        0
    };

    let estimated_time_remaining_ms = match state.start_time {
        Some(start) if completed > 0 => {
            let elapsed = (now - start).num_milliseconds().max(0) as f64;
            let per_chunk = elapsed / completed as f64;
            Some((per_chunk * (pending + processing.len()) as f64).round() as u64)
        }
        _ => None,
    };

    let current_status = match state.run_state {
        RunState::Running if !processing.is_empty() => {
            let list: Vec<String> = processing.iter().map(|i| (i + 1).to_string()).collect();
            format!("Processing chunks: {}", list.join(", "))
        }
        RunState::Running => "Waiting for next batch...".to_string(),
        RunState::Completed => format!("Completed! {}/{} successful", completed, total),
        RunState::Paused => "Paused".to_string(),
        RunState::Error => "Error occurred".to_string(),
        RunState::Idle => "Idle".to_string(),
    };

    Progress {
        total_chunks: total,
        completed_chunks: completed,
        failed_chunks: failed,
        pending_chunks: pending,
        processing_chunks: processing,
        interrupted_chunks: state.interrupted().len(),
        overall_progress,
        estimated_time_remaining_ms,
        current_status,
        run_state: state.run_state,
    }
}

/// Format milliseconds as `42s`, `7m` or `2h 5m`.
pub fn format_time_remaining(ms: u64) -> String {
    if ms < 60_000 {
        format!("{}s", (ms as f64 / 1000.0).round() as u64)
    } else if ms < 3_600_000 {
        format!("{}m", (ms as f64 / 60_000.0).round() as u64)
    } else {
        let hours = ms / 3_600_000;
        let minutes = ((ms % 3_600_000) as f64 / 60_000.0).round() as u64;
        format!("{}h {}m", hours, minutes)
    }
}
