//! Chunked batch pipeline.
//!
//! Items are split into fixed-size chunks; up to `concurrency` chunks run at
//! once, each through assembly, submission, polling and result download.
//!
//! ```text
//! PipelineController ──commands──▶ driver task (owns PipelineState)
//!                                    │  admit_next()
//!                                    ▼
//!                           JoinSet of chunk workers
//!                                    │  ChunkUpdate
//!                                    ▼
//!                     driver applies, publishes watch snapshot
//! ```

mod chunk;
mod controller;
mod error;
pub mod payload;
mod poller;
mod progress;
mod scheduler;
mod state;
mod worker;

pub use chunk::{split_into_chunks, Chunk, ChunkStatus, ResultMeta};
pub use controller::{PipelineController, PipelineOptions, PipelineServices};
pub use error::PipelineError;
pub use payload::{AssemblerOptions, AssemblyError, ImagePayloadAssembler, Payload, PayloadAssembler};
pub use poller::{poll_until_terminal, PollOutcome, PollPolicy};
pub use progress::{format_time_remaining, summarize, summarize_at, Progress};
pub use scheduler::admit_next;
pub use state::{ChunkEvent, PipelineState, RunState, StopPolicy};
pub use worker::{ChunkUpdate, ResultProcessor};
