//! Web server command.

use console::style;

use crate::config::Settings;

/// Start the HTTP API server.
pub async fn cmd_serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    if settings.api_key.is_none() {
        eprintln!(
            "{} GEMINI_API_KEY is not set; batch endpoints will fail",
            style("!").yellow()
        );
    }

    println!(
        "{} Starting rugbatch server at http://{}:{}",
        style("→").cyan(),
        host,
        port
    );
    println!("  Results: {}", settings.output_dir.display());
    println!("  Press Ctrl+C to stop");

    crate::server::serve(settings, host, port).await
}
