//! Live progress display for a pipeline run.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::{Progress, RunState};

/// Single bar tracking settled chunks, with in-flight chunks and ETA in the
/// message.
pub struct PipelineProgress {
    bar: ProgressBar,
}

impl PipelineProgress {
    pub fn new(total_chunks: usize) -> Self {
        let bar = ProgressBar::new(total_chunks as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} chunks {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn update(&self, progress: &Progress) {
        self.bar
            .set_position((progress.completed_chunks + progress.failed_chunks) as u64);

        let mut parts = Vec::new();
        if progress.failed_chunks > 0 {
            parts.push(style(format!("{} failed", progress.failed_chunks)).red().to_string());
        }
        if !progress.processing_chunks.is_empty() {
            let running: Vec<String> = progress
                .processing_chunks
                .iter()
                .map(|i| (i + 1).to_string())
                .collect();
            parts.push(format!("running [{}]", running.join(", ")));
        }
        if progress.run_state == RunState::Paused {
            parts.push(style("paused").yellow().to_string());
        }
        if let Some(eta) = progress.eta_display() {
            parts.push(format!("~{} left", eta));
        }
        self.bar.set_message(parts.join(" | "));
    }

    /// Print above the bar without corrupting it.
    pub fn println(&self, message: impl AsRef<str>) {
        self.bar.println(message);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
