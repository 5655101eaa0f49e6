//! Result extraction and image archive commands.

use std::path::{Path, PathBuf};

use console::style;

use crate::config::Settings;
use crate::logging::PipelineLogger;
use crate::results::{archive_name, list_image_dates, zip_images, ResultStore};

/// Save a result JSONL under today's folder and extract its images.
pub async fn cmd_extract(settings: &Settings, file: &Path, chunk: usize) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file).await?;
    settings.ensure_directories()?;

    let store = ResultStore::new(settings.output_dir.clone(), PipelineLogger::tracing());
    let saved = store.save_and_extract(chunk, &content, &[]).await?;

    println!(
        "{} Extracted {} of {} results",
        style("✓").green(),
        saved.extracted_images.len(),
        saved.total_results
    );
    println!("  {} JSONL:  {}", style("→").dim(), saved.jsonl_path.display());
    println!("  {} Images: {}", style("→").dim(), saved.images_dir.display());
    for error in &saved.errors {
        println!("  {} {}", style("!").yellow(), error);
    }
    Ok(())
}

/// Zip every image for a date folder.
pub async fn cmd_archive(
    settings: &Settings,
    date: Option<String>,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let date = date.unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
    let output_dir = settings.output_dir.clone();

    let zip_date = date.clone();
    let bytes = tokio::task::spawn_blocking(move || zip_images(&output_dir, &zip_date)).await??;

    let path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(archive_name(&date)));
    tokio::fs::write(&path, &bytes).await?;

    println!(
        "{} Wrote {} ({} bytes)",
        style("✓").green(),
        path.display(),
        bytes.len()
    );
    Ok(())
}

/// List date folders with images, newest first.
pub async fn cmd_dates(settings: &Settings) -> anyhow::Result<()> {
    let output_dir = settings.output_dir.clone();
    let dates = tokio::task::spawn_blocking(move || list_image_dates(&output_dir)).await??;

    if dates.is_empty() {
        println!(
            "{} No images under {}",
            style("!").yellow(),
            settings.output_dir.display()
        );
        return Ok(());
    }

    for entry in dates {
        println!(
            "  {}  {} images",
            style(&entry.date).bold(),
            entry.image_count
        );
    }
    Ok(())
}
