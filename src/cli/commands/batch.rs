//! Single batch job commands.

use std::path::Path;

use console::style;

use crate::config::Settings;
use crate::gemini::{BatchJobService, GeminiBatchClient, JobHandle, JobStatus};

fn client(settings: &Settings) -> anyhow::Result<GeminiBatchClient> {
    let client = GeminiBatchClient::new(settings.client_config())?;
    if !client.has_api_key() {
        anyhow::bail!("Gemini API key not configured (set GEMINI_API_KEY)");
    }
    Ok(client)
}

fn print_status(status: &JobStatus) {
    let state = if status.state.is_success() {
        style(status.state.label()).green()
    } else if status.state.is_failure() {
        style(status.state.label()).red()
    } else {
        style(status.state.label()).yellow()
    };

    println!("{} {}", style(status.handle().id()).bold(), state);
    if !status.display_name.is_empty() {
        println!("  Name:      {}", status.display_name);
    }
    if status.request_count > 0 {
        println!(
            "  Requests:  {} ({} completed, {} failed)",
            status.request_count, status.completed_count, status.failed_count
        );
    }
    if let Some(created) = &status.create_time {
        println!("  Created:   {}", created);
    }
    if let Some(ended) = &status.end_time {
        println!("  Ended:     {}", ended);
    }
    if let Some(file) = &status.output_file {
        println!("  Output:    {}", file);
    }
    if let Some(error) = &status.error {
        println!("  Error:     {}", style(error).red());
    }
}

/// Upload a JSONL payload and create a batch job from it.
pub async fn cmd_submit(
    settings: &Settings,
    file: &Path,
    name: Option<String>,
) -> anyhow::Result<()> {
    let jsonl = tokio::fs::read_to_string(file).await?;
    if jsonl.trim().is_empty() {
        anyhow::bail!("{} is empty", file.display());
    }
    let lines = jsonl.lines().filter(|l| !l.trim().is_empty()).count();

    let display_name = name.unwrap_or_else(|| {
        format!("Rug Batch - {}", chrono::Utc::now().format("%Y-%m-%d"))
    });
    let status = client(settings)?.submit(&display_name, &jsonl).await?;

    println!(
        "{} Submitted {} requests",
        style("✓").green(),
        lines
    );
    print_status(&status);
    Ok(())
}

pub async fn cmd_status(settings: &Settings, batch_id: &str) -> anyhow::Result<()> {
    let status = client(settings)?.get_batch(&JobHandle::new(batch_id)).await?;
    print_status(&status);
    Ok(())
}

pub async fn cmd_cancel(settings: &Settings, batch_id: &str) -> anyhow::Result<()> {
    let job = JobHandle::new(batch_id);
    client(settings)?.cancel_batch(&job).await?;
    println!("{} Cancel requested for {}", style("✓").green(), job.id());
    Ok(())
}

pub async fn cmd_delete(settings: &Settings, batch_id: &str) -> anyhow::Result<()> {
    let job = JobHandle::new(batch_id);
    client(settings)?.delete_batch(&job).await?;
    println!("{} Deleted {}", style("✓").green(), job.id());
    Ok(())
}

/// Download a result file to `out`, or stdout.
pub async fn cmd_download(
    settings: &Settings,
    file_name: &str,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let content = client(settings)?.download_file(file_name).await?;

    match out {
        Some(path) => {
            tokio::fs::write(path, &content).await?;
            let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
            eprintln!(
                "{} Wrote {} results to {}",
                style("✓").green(),
                lines,
                path.display()
            );
        }
        None => print!("{}", content),
    }
    Ok(())
}
