//! Configuration display command.

use console::style;

use crate::config::{Config, Settings};

/// Print the effective settings and where they came from.
pub fn cmd_config_show(settings: &Settings, config: &Config) -> anyhow::Result<()> {
    match &config.source_path {
        Some(path) => println!("{} Config file: {}", style("→").cyan(), path.display()),
        None => println!("{} No config file found; using defaults", style("→").cyan()),
    }
    println!();

    let on_off = |b: bool| if b { "yes" } else { "no" };
    let rows: Vec<(&str, String)> = vec![
        ("output_dir", settings.output_dir.display().to_string()),
        ("chunk_size", settings.chunk_size.to_string()),
        ("concurrency", settings.concurrency.to_string()),
        ("poll.interval", format!("{}s", settings.poll_interval.as_secs())),
        (
            "poll.max_consecutive_failures",
            settings
                .poll_max_consecutive_failures
                .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
        ),
        (
            "poll.backoff_multiplier",
            settings
                .poll_backoff_multiplier
                .map_or_else(|| "none".to_string(), |m| m.to_string()),
        ),
        (
            "poll.max_interval",
            settings
                .poll_max_interval
                .map_or_else(|| "none".to_string(), |d| format!("{}s", d.as_secs())),
        ),
        ("stop_policy", format!("{:?}", settings.stop_policy).to_lowercase()),
        ("include_images", on_off(settings.include_images).to_string()),
        ("image_timeout", format!("{}s", settings.image_timeout.as_secs())),
        ("max_image_bytes", settings.max_image_bytes.to_string()),
        ("model", settings.model.clone()),
        ("api_base_url", settings.api_base_url.clone()),
        ("api_key", on_off(settings.api_key.is_some()).to_string()),
        ("request_timeout", format!("{}s", settings.request_timeout.as_secs())),
        ("log_capacity", settings.log_capacity.to_string()),
    ];

    for (name, value) in rows {
        println!("  {:<30} {}", style(name).bold(), value);
    }
    println!("  {:<30} {}", style("prompt_template").bold(), settings.prompt_template);

    Ok(())
}
