//! Per-chunk lifecycle task: assemble, submit, poll, fetch results.
//!
//! Workers never touch `PipelineState`; they report `ChunkUpdate`s to the
//! controller's driver, which owns the state.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::chunk::ResultMeta;
use super::payload::PayloadAssembler;
use super::poller::{poll_until_terminal, PollOutcome, PollPolicy};
use super::state::ChunkEvent;
use crate::gemini::{BatchJobService, JobStatus};
use crate::logging::PipelineLogger;
use crate::models::Item;

/// Handles a successful job's raw result content.
#[async_trait]
pub trait ResultProcessor: Send + Sync {
    /// Persist and extract results. An `Err` marks the chunk's results as
    /// degraded; it never fails the chunk.
    async fn process(
        &self,
        chunk_index: usize,
        items: &[Item],
        content: &str,
    ) -> Result<ResultMeta, String>;
}

/// Event for one chunk, tagged with the run epoch it was produced in.
#[derive(Debug, Clone)]
pub struct ChunkUpdate {
    pub epoch: u64,
    pub index: usize,
    pub event: ChunkEvent,
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub service: Arc<dyn BatchJobService>,
    pub assembler: Arc<dyn PayloadAssembler>,
    pub results: Arc<dyn ResultProcessor>,
    pub poll: PollPolicy,
    pub logger: PipelineLogger,
}

struct Reporter {
    tx: UnboundedSender<ChunkUpdate>,
    epoch: u64,
    index: usize,
}

impl Reporter {
    fn send(&self, event: ChunkEvent) {
        // The driver outlives its workers; a closed channel only happens
        // during teardown.
        let _ = self.tx.send(ChunkUpdate {
            epoch: self.epoch,
            index: self.index,
            event,
        });
    }

    fn fail(&self, error: String, job: Option<JobStatus>) {
        self.send(ChunkEvent::Failed { error, job });
    }
}

/// Drive one admitted chunk to a terminal event, or until cancelled.
pub async fn run_chunk(
    ctx: Arc<WorkerContext>,
    epoch: u64,
    index: usize,
    items: Arc<Vec<Item>>,
    cancel: CancellationToken,
    tx: UnboundedSender<ChunkUpdate>,
) {
    let reporter = Reporter { tx, epoch, index };
    let run = AssertUnwindSafe(drive(&ctx, index, &items, &cancel, &reporter)).catch_unwind();

    if run.await.is_err() {
        ctx.logger.chunk(index).error("PIPELINE", "Chunk worker panicked");
        reporter.fail("Internal error while processing chunk".to_string(), None);
    }
}

async fn drive(
    ctx: &WorkerContext,
    index: usize,
    items: &[Item],
    cancel: &CancellationToken,
    reporter: &Reporter,
) {
    let logger = &ctx.logger;
    logger.chunk(index).info(
        "PIPELINE",
        format!("Preparing chunk {} ({} items)", index + 1, items.len()),
    );

    let assembled = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = ctx.assembler.assemble(index, items) => r,
    };
    let jsonl = match assembled.and_then(|payload| payload.to_jsonl()) {
        Ok(jsonl) => jsonl,
        Err(e) => {
            logger
                .chunk(index)
                .error("PIPELINE", format!("Payload assembly failed: {}", e));
            reporter.fail(e.to_string(), None);
            return;
        }
    };

    let display_name = format!(
        "Rug Batch Chunk {} - {}",
        index + 1,
        Utc::now().format("%Y-%m-%d")
    );
    let submitted = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = ctx.service.submit(&display_name, &jsonl) => r,
    };
    let job = match submitted {
        Ok(status) => status,
        Err(e) => {
            logger
                .chunk(index)
                .error("PIPELINE", format!("Submission failed: {}", e));
            reporter.fail(format!("Failed to submit batch: {}", e), None);
            return;
        }
    };
    let handle = job.handle();
    logger
        .chunk(index)
        .job(handle.as_str())
        .info("PIPELINE", format!("Submitted {} bytes", jsonl.len()));
    reporter.send(ChunkEvent::Submitted(job));

    let outcome = poll_until_terminal(
        ctx.service.as_ref(),
        &handle,
        &ctx.poll,
        cancel,
        logger,
        index,
        |status| reporter.send(ChunkEvent::Polled(status)),
    )
    .await;

    let status = match outcome {
        PollOutcome::Succeeded(status) => status,
        PollOutcome::Failed { reason, job } => {
            reporter.fail(reason, job);
            return;
        }
        PollOutcome::Cancelled => return,
    };

    let output_file = status.output_file.clone();
    reporter.send(ChunkEvent::Succeeded(status));

    let meta = match output_file {
        None => ResultMeta::degraded("job succeeded without an output file"),
        Some(file) => {
            let downloaded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = ctx.service.download(&file) => r,
            };
            match downloaded {
                Err(e) => ResultMeta::degraded(format!("Result download failed: {}", e)),
                Ok(content) => {
                    let processed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        r = ctx.results.process(index, items, &content) => r,
                    };
                    processed.unwrap_or_else(|e| {
                        ResultMeta::degraded(format!("Result extraction failed: {}", e))
                    })
                }
            }
        }
    };

    match &meta.error {
        Some(error) => logger
            .chunk(index)
            .job(handle.as_str())
            .warn("RESULTS", format!("Completed with degraded results: {}", error)),
        None => logger.chunk(index).job(handle.as_str()).info(
            "RESULTS",
            format!(
                "Completed: {} images, {} item errors",
                meta.image_count,
                meta.errors.len()
            ),
        ),
    }
    reporter.send(ChunkEvent::Finished(meta));
}
