//! Aggregate pipeline state and its transitions.
//!
//! `PipelineState` is plain data mutated only by the controller's driver
//! task. Every mutation goes through a method here so the counters and the
//! in-flight set stay consistent with chunk statuses.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chunk::{split_into_chunks, Chunk, ChunkStatus, ResultMeta};
use super::PipelineError;
use crate::gemini::JobStatus;
use crate::models::Item;

/// Whether the scheduler may admit new chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Completed,
    /// Reserved for initialization failures, never chunk failures.
    Error,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What `stop()` does with chunks that were in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Leave them in their last non-terminal status (interrupted).
    #[default]
    Leave,
    /// Reset them to pending so a later start resubmits them.
    Requeue,
    /// Mark them failed.
    Fail,
}

impl FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leave" => Ok(StopPolicy::Leave),
            "requeue" => Ok(StopPolicy::Requeue),
            "fail" => Ok(StopPolicy::Fail),
            other => Err(format!(
                "unknown stop policy '{}' (expected leave, requeue or fail)",
                other
            )),
        }
    }
}

/// Message from a chunk worker describing what happened to its chunk.
#[derive(Debug, Clone)]
pub enum ChunkEvent {
    /// Payload accepted by the remote service.
    Submitted(JobStatus),
    /// Remote job observed in a non-terminal state.
    Polled(JobStatus),
    /// Remote job succeeded; result download starting.
    Succeeded(JobStatus),
    /// Local result processing finished (possibly degraded).
    Finished(ResultMeta),
    Failed {
        error: String,
        job: Option<JobStatus>,
    },
}

impl ChunkEvent {
    fn target(&self, current: ChunkStatus) -> Option<ChunkStatus> {
        match self {
            ChunkEvent::Submitted(_) => Some(ChunkStatus::Submitted),
            ChunkEvent::Polled(_) if current == ChunkStatus::Submitted => {
                Some(ChunkStatus::Processing)
            }
            ChunkEvent::Polled(_) => None,
            ChunkEvent::Succeeded(_) => Some(ChunkStatus::DownloadingResults),
            ChunkEvent::Finished(_) => Some(ChunkStatus::Completed),
            ChunkEvent::Failed { .. } => Some(ChunkStatus::Failed),
        }
    }
}

/// The aggregate root: every chunk plus scheduling bookkeeping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub chunks: Vec<Chunk>,
    pub concurrency_limit: usize,
    pub in_flight: BTreeSet<usize>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub run_state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineState {
    pub fn new(
        items: Vec<Item>,
        chunk_size: usize,
        concurrency_limit: usize,
    ) -> Result<Self, PipelineError> {
        if concurrency_limit == 0 {
            return Err(PipelineError::InvalidConcurrency);
        }
        let chunks = split_into_chunks(items, chunk_size)?;
        Ok(Self {
            chunks,
            concurrency_limit,
            in_flight: BTreeSet::new(),
            completed_count: 0,
            failed_count: 0,
            run_state: RunState::Idle,
            start_time: None,
            end_time: None,
            error: None,
        })
    }

    pub fn total(&self) -> usize {
        self.chunks.len()
    }

    pub fn item_count(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn pending_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .count()
    }

    /// Chunks left non-terminal outside the in-flight set by a stop.
    pub fn interrupted(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.status.is_active() && !self.in_flight.contains(&c.index))
            .map(|c| c.index)
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.chunks.iter().all(|c| c.status.is_terminal())
    }

    /// Nothing more can happen without operator action: no pending chunks
    /// and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty() && self.pending_count() == 0
    }

    pub fn free_slots(&self) -> usize {
        self.concurrency_limit.saturating_sub(self.in_flight.len())
    }

    /// Mark the run as started. `start_time` is only set the first time.
    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        self.run_state = RunState::Running;
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    /// Admit a pending chunk: `pending -> preparing` and add it to the
    /// in-flight set.
    pub fn admit(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), PipelineError> {
        if self.in_flight.len() >= self.concurrency_limit {
            return Err(PipelineError::AdmissionRejected {
                index,
                reason: "no free slot".to_string(),
            });
        }
        let chunk = self
            .chunks
            .get_mut(index)
            .ok_or(PipelineError::UnknownChunk { index })?;
        chunk.transition(ChunkStatus::Preparing, now)?;
        self.in_flight.insert(index);
        Ok(())
    }

    /// Apply a worker event to an in-flight chunk.
    ///
    /// Returns `Ok(false)` when the event is stale: the chunk is terminal or
    /// no longer in flight. Terminal states are never exited.
    pub fn apply(
        &mut self,
        index: usize,
        event: ChunkEvent,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let chunk = self
            .chunks
            .get_mut(index)
            .ok_or(PipelineError::UnknownChunk { index })?;
        if chunk.status.is_terminal() || !self.in_flight.contains(&index) {
            return Ok(false);
        }

        if let Some(next) = event.target(chunk.status) {
            chunk.transition(next, now)?;
        }

        match event {
            ChunkEvent::Submitted(job) => {
                chunk.job = Some(job.handle());
                chunk.job_snapshot = Some(job);
            }
            ChunkEvent::Polled(job) | ChunkEvent::Succeeded(job) => {
                chunk.job_snapshot = Some(job);
            }
            ChunkEvent::Finished(meta) => {
                chunk.result_meta = Some(meta);
            }
            ChunkEvent::Failed { error, job } => {
                chunk.error = Some(error);
                if job.is_some() {
                    chunk.job_snapshot = job;
                }
            }
        }

        match chunk.status {
            ChunkStatus::Completed => {
                self.completed_count += 1;
                self.in_flight.remove(&index);
            }
            ChunkStatus::Failed => {
                self.failed_count += 1;
                self.in_flight.remove(&index);
            }
            _ => {}
        }
        Ok(true)
    }

    pub fn pause(&mut self) -> Result<(), PipelineError> {
        match self.run_state {
            RunState::Running => {
                self.run_state = RunState::Paused;
                Ok(())
            }
            RunState::Paused => Ok(()),
            state => Err(PipelineError::InvalidRunState {
                action: "pause",
                state,
            }),
        }
    }

    pub fn resume(&mut self) -> Result<(), PipelineError> {
        match self.run_state {
            RunState::Paused => {
                self.run_state = RunState::Running;
                Ok(())
            }
            RunState::Running => Ok(()),
            state => Err(PipelineError::InvalidRunState {
                action: "resume",
                state,
            }),
        }
    }

    /// Clear the in-flight set and apply `policy` to the chunks that were in
    /// it. Returns the affected indices.
    pub fn stop(&mut self, policy: StopPolicy, now: DateTime<Utc>) -> Vec<usize> {
        let interrupted: Vec<usize> = std::mem::take(&mut self.in_flight).into_iter().collect();

        for &index in &interrupted {
            let Some(chunk) = self.chunks.get_mut(index) else {
                continue;
            };
            match policy {
                StopPolicy::Leave => {}
                StopPolicy::Requeue => {
                    chunk.status = ChunkStatus::Pending;
                    chunk.job = None;
                    chunk.job_snapshot = None;
                    chunk.start_time = None;
                }
                StopPolicy::Fail => {
                    chunk.status = ChunkStatus::Failed;
                    chunk.error = Some("Stopped before completion".to_string());
                    chunk.end_time = Some(now);
                    self.failed_count += 1;
                }
            }
        }

        if matches!(self.run_state, RunState::Running | RunState::Paused) {
            self.run_state = RunState::Idle;
        }
        self.finish_if_done(now);
        interrupted
    }

    /// Transition to `completed` once every chunk is terminal. Returns true
    /// on the transition.
    pub fn finish_if_done(&mut self, now: DateTime<Utc>) -> bool {
        if self.run_state == RunState::Completed || self.chunks.is_empty() || !self.all_terminal()
        {
            return false;
        }
        if self.run_state == RunState::Error {
            return false;
        }
        self.run_state = RunState::Completed;
        self.end_time = Some(now);
        true
    }

    /// Verify the structural invariants. Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let total = self.total();
        let pending = self.pending_count();
        let interrupted = self.interrupted().len();
        let accounted = self.completed_count + self.failed_count + pending + self.in_flight.len()
            + interrupted;
        if accounted != total {
            return Err(format!(
                "completed {} + failed {} + pending {} + in-flight {} + interrupted {} != total {}",
                self.completed_count,
                self.failed_count,
                pending,
                self.in_flight.len(),
                interrupted,
                total
            ));
        }
        if self.in_flight.len() > self.concurrency_limit {
            return Err(format!(
                "in-flight {} exceeds limit {}",
                self.in_flight.len(),
                self.concurrency_limit
            ));
        }

        let completed = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count();
        let failed = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .count();
        if completed != self.completed_count || failed != self.failed_count {
            return Err(format!(
                "counters ({}, {}) disagree with statuses ({}, {})",
                self.completed_count, self.failed_count, completed, failed
            ));
        }

        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != position {
                return Err(format!("chunk at {} has index {}", position, chunk.index));
            }
            if self.in_flight.contains(&chunk.index) && !chunk.status.is_active() {
                return Err(format!(
                    "chunk {} is in flight but {}",
                    chunk.index, chunk.status
                ));
            }
            if chunk.status.requires_job() != chunk.job.is_some()
                && chunk.status != ChunkStatus::Failed
            {
                return Err(format!(
                    "chunk {} is {} with job handle {:?}",
                    chunk.index, chunk.status, chunk.job
                ));
            }
            if let (Some(start), Some(end)) = (chunk.start_time, chunk.end_time) {
                if start > end {
                    return Err(format!("chunk {} ends before it starts", chunk.index));
                }
            }
            if chunk.error.is_some() && chunk.status != ChunkStatus::Failed {
                return Err(format!("chunk {} has an error but is {}", chunk.index, chunk.status));
            }
        }
        Ok(())
    }
}
