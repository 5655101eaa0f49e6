//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod batch;
mod config_cmd;
mod results;
mod run;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};
use crate::pipeline::StopPolicy;

#[derive(Parser)]
#[command(name = "rugbatch")]
#[command(about = "Chunked Gemini batch image generation for rug catalogs")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output directory for results (overrides config file)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Resolve relative paths from current working directory instead of config file location
    #[arg(long, global = true)]
    cwd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline over a CSV (or JSON) catalog
    Run {
        /// Input file
        input: PathBuf,
        /// Items per batch job
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Batch jobs in flight at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// What Ctrl-C does with in-flight chunks: leave, requeue or fail
        #[arg(long)]
        stop_policy: Option<StopPolicy>,
        /// Send prompts only, without embedding source images
        #[arg(long)]
        no_images: bool,
    },

    /// Submit a pre-built JSONL payload as a single batch job
    Submit {
        file: PathBuf,
        /// Display name for the job
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show a batch job's status
    Status { batch_id: String },

    /// Cancel a batch job
    Cancel { batch_id: String },

    /// Delete a batch job
    Delete { batch_id: String },

    /// Download a result file (files/...)
    Download {
        file_name: String,
        /// Write to this path instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Save a result JSONL file and extract its images
    Extract {
        file: PathBuf,
        /// Zero-based chunk index used for file naming
        #[arg(long, default_value = "0")]
        chunk: usize,
    },

    /// Zip all images for a date
    Archive {
        /// Date folder (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<String>,
        /// Output zip path (default: rug-images-<date>.zip)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List date folders that contain images
    Dates,

    /// Start the HTTP API server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },

    /// Show effective configuration
    Config,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        use_cwd: cli.cwd,
        output_dir: cli.output,
    };
    let (mut settings, config) = load_settings_with_options(options)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Run {
            input,
            chunk_size,
            concurrency,
            stop_policy,
            no_images,
        } => {
            if let Some(size) = chunk_size {
                settings.chunk_size = size;
            }
            if let Some(limit) = concurrency {
                settings.concurrency = limit;
            }
            if let Some(policy) = stop_policy {
                settings.stop_policy = policy;
            }
            if no_images {
                settings.include_images = false;
            }
            run::cmd_run(&settings, &input).await
        }
        Commands::Submit { file, name } => batch::cmd_submit(&settings, &file, name).await,
        Commands::Status { batch_id } => batch::cmd_status(&settings, &batch_id).await,
        Commands::Cancel { batch_id } => batch::cmd_cancel(&settings, &batch_id).await,
        Commands::Delete { batch_id } => batch::cmd_delete(&settings, &batch_id).await,
        Commands::Download { file_name, out } => {
            batch::cmd_download(&settings, &file_name, out.as_deref()).await
        }
        Commands::Extract { file, chunk } => results::cmd_extract(&settings, &file, chunk).await,
        Commands::Archive { date, out } => {
            results::cmd_archive(&settings, date, out.as_deref()).await
        }
        Commands::Dates => results::cmd_dates(&settings).await,
        Commands::Serve { host, port } => serve::cmd_serve(&settings, &host, port).await,
        Commands::Config => config_cmd::cmd_config_show(&settings, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "rugbatch",
            "-v",
            "run",
            "rugs.csv",
            "--chunk-size",
            "50",
            "-j",
            "3",
            "--stop-policy",
            "requeue",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                input,
                chunk_size,
                concurrency,
                stop_policy,
                no_images,
            } => {
                assert_eq!(input, PathBuf::from("rugs.csv"));
                assert_eq!(chunk_size, Some(50));
                assert_eq!(concurrency, Some(3));
                assert_eq!(stop_policy, Some(StopPolicy::Requeue));
                assert!(!no_images);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_rejects_unknown_stop_policy() {
        let result = Cli::try_parse_from(["rugbatch", "run", "rugs.csv", "--stop-policy", "drop"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_output_after_subcommand() {
        let cli = Cli::try_parse_from(["rugbatch", "dates", "--output", "/tmp/out"]).unwrap();
        assert_eq!(cli.output, Some(PathBuf::from("/tmp/out")));
        assert!(matches!(cli.command, Commands::Dates));
    }
}
