//! Full pipeline run with live progress.

use std::path::Path;
use std::sync::Arc;

use console::style;

use crate::cli::progress::PipelineProgress;
use crate::config::Settings;
use crate::gemini::GeminiBatchClient;
use crate::logging::PipelineLogger;
use crate::models::load_items;
use crate::pipeline::{
    summarize, ChunkStatus, ImagePayloadAssembler, PipelineController, PipelineServices,
    PipelineState, RunState,
};
use crate::results::ResultStore;

/// Load items, run every chunk to completion and print a summary.
///
/// Ctrl-C stops the pipeline using the configured stop policy.
pub async fn cmd_run(settings: &Settings, input: &Path) -> anyhow::Result<()> {
    let items = load_items(input, &settings.prompt_template)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", input.display(), e))?;

    let client = GeminiBatchClient::new(settings.client_config())?;
    if !client.has_api_key() {
        anyhow::bail!("Gemini API key not configured (set GEMINI_API_KEY)");
    }
    settings.ensure_directories()?;

    let logger = PipelineLogger::tracing();
    let services = PipelineServices {
        service: Arc::new(client),
        assembler: Arc::new(ImagePayloadAssembler::new(
            settings.assembler_options(),
            logger.clone(),
        )?),
        results: Arc::new(ResultStore::new(settings.output_dir.clone(), logger.clone())),
        logger,
    };

    let item_count = items.len();
    let controller = PipelineController::initialize(items, settings.pipeline_options(), services)?;
    let total = controller.snapshot().total();

    println!(
        "{} {} items in {} chunks of up to {} ({} at a time)",
        style("→").cyan(),
        item_count,
        total,
        settings.chunk_size,
        settings.concurrency
    );
    println!("  Press Ctrl+C to stop");

    let display = PipelineProgress::new(total);
    let mut updates = controller.subscribe();
    controller.start().await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut interrupted = false;
    loop {
        let state = updates.borrow_and_update().clone();
        display.update(&summarize(&state));
        if is_settled(&state) {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                display.println(format!("{} Stopping pipeline...", style("!").yellow()));
                controller.stop().await?;
                interrupted = true;
                break;
            }
        }
    }
    display.finish();

    let state = controller.snapshot();
    print_summary(&state, settings, interrupted);
    Ok(())
}

fn is_settled(state: &PipelineState) -> bool {
    state.in_flight.is_empty()
        && matches!(
            state.run_state,
            RunState::Completed | RunState::Idle | RunState::Error
        )
}

fn print_summary(state: &PipelineState, settings: &Settings, interrupted: bool) {
    let progress = summarize(state);

    if interrupted {
        println!(
            "{} Stopped: {} completed, {} failed, {} pending, {} interrupted",
            style("!").yellow(),
            progress.completed_chunks,
            progress.failed_chunks,
            progress.pending_chunks,
            progress.interrupted_chunks
        );
    } else {
        println!(
            "{} Finished: {}/{} chunks completed, {} failed",
            if progress.failed_chunks == 0 {
                style("✓").green()
            } else {
                style("✗").red()
            },
            progress.completed_chunks,
            progress.total_chunks,
            progress.failed_chunks
        );
    }

    let mut images = 0;
    for chunk in &state.chunks {
        match chunk.status {
            ChunkStatus::Failed => println!(
                "  {} chunk {}: {}",
                style("✗").red(),
                chunk.index + 1,
                chunk.error.as_deref().unwrap_or("unknown error")
            ),
            ChunkStatus::Completed => {
                if let Some(meta) = &chunk.result_meta {
                    images += meta.image_count;
                    if let Some(error) = &meta.error {
                        println!(
                            "  {} chunk {}: {}",
                            style("!").yellow(),
                            chunk.index + 1,
                            error
                        );
                    }
                }
            }
            _ => {}
        }
    }

    println!(
        "  {} {} images saved under {}",
        style("→").dim(),
        images,
        settings.output_dir.display()
    );
}
