//! rugbatch - chunked Gemini batch image generation for rug catalogs.
//!
//! Splits a catalog into chunks, runs each chunk as a Gemini batch job with
//! bounded concurrency, and saves the generated images by date.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    let default_filter = if rugbatch::cli::is_verbose() {
        "rugbatch=info"
    } else {
        "rugbatch=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    rugbatch::cli::run().await
}
