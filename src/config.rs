//! Configuration management for rugbatch using the prefer crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gemini::{api_key_from_env, GeminiClientConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::models::DEFAULT_PROMPT_TEMPLATE;
use crate::pipeline::{AssemblerOptions, PipelineOptions, PollPolicy, StopPolicy};

/// Default number of items per batch job.
pub const DEFAULT_CHUNK_SIZE: usize = 75;
/// Default number of batch jobs in flight.
pub const DEFAULT_CONCURRENCY: usize = 5;
/// Default batch status polling interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the dated result folders.
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub poll_max_consecutive_failures: Option<u32>,
    pub poll_backoff_multiplier: Option<f64>,
    pub poll_max_interval: Option<Duration>,
    pub stop_policy: StopPolicy,
    /// Embed source images in requests.
    pub include_images: bool,
    pub image_timeout: Duration,
    pub max_image_bytes: usize,
    pub model: String,
    pub api_base_url: String,
    pub api_key: Option<String>,
    /// Timeout for Gemini API requests.
    pub request_timeout: Duration,
    /// Prompt template used when the input has no prompt column.
    pub prompt_template: String,
    /// Entries kept by the in-memory log buffer.
    pub log_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_max_consecutive_failures: None,
            poll_backoff_multiplier: None,
            poll_max_interval: None,
            stop_policy: StopPolicy::Leave,
            include_images: true,
            image_timeout: Duration::from_secs(30),
            max_image_bytes: 10 * 1024 * 1024,
            model: DEFAULT_MODEL.to_string(),
            api_base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            log_capacity: 1000,
        }
    }
}

impl Settings {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_consecutive_failures: self.poll_max_consecutive_failures,
            backoff_multiplier: self.poll_backoff_multiplier,
            max_interval: self.poll_max_interval,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            poll: self.poll_policy(),
            stop_policy: self.stop_policy,
        }
    }

    pub fn assembler_options(&self) -> AssemblerOptions {
        AssemblerOptions {
            include_images: self.include_images,
            image_timeout: self.image_timeout,
            max_image_bytes: self.max_image_bytes,
        }
    }

    pub fn client_config(&self) -> GeminiClientConfig {
        GeminiClientConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            base_url: self.api_base_url.clone(),
            request_timeout: self.request_timeout,
            ..GeminiClientConfig::default()
        }
    }

    /// Create the output directory if needed.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)
    }
}

/// Largest accepted `poll.backoff_multiplier`.
const MAX_BACKOFF_MULTIPLIER: f32 = 10.0;

/// Batch polling section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, prefer::FromValue)]
pub struct PollConfig {
    /// Polling interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Fail a chunk after this many consecutive status errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_failures: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f32>,
    /// Upper bound for the backed-off interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<u64>,
}

impl PollConfig {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct Config {
    /// Output directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "PollConfig::is_default")]
    #[prefer(default)]
    pub poll: PollConfig,
    /// `leave`, `requeue` or `fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_images: Option<bool>,
    /// Image download timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_image_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    /// Gemini request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_capacity: Option<usize>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    #[prefer(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Automatically discovers rugbatch config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("rugbatch").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Ignoring config {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// Supports JSON, TOML and YAML based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Directory of the config file, if loaded from one.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved relative to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) -> Result<(), String> {
        if let Some(ref dir) = self.output_dir {
            settings.output_dir = self.resolve_path(dir, base_dir);
        }
        if let Some(size) = self.chunk_size {
            if size == 0 {
                return Err("chunk_size must be positive".to_string());
            }
            settings.chunk_size = size;
        }
        if let Some(limit) = self.concurrency {
            if limit == 0 {
                return Err("concurrency must be positive".to_string());
            }
            settings.concurrency = limit;
        }
        if let Some(secs) = self.poll.interval {
            settings.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(max) = self.poll.max_consecutive_failures {
            settings.poll_max_consecutive_failures = Some(max);
        }
        if let Some(multiplier) = self.poll.backoff_multiplier {
            if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&multiplier) {
                return Err(format!(
                    "poll.backoff_multiplier must be between 1 and {}",
                    MAX_BACKOFF_MULTIPLIER
                ));
            }
            settings.poll_backoff_multiplier = Some(f64::from(multiplier));
        }
        if let Some(secs) = self.poll.max_interval {
            settings.poll_max_interval = Some(Duration::from_secs(secs));
        }
        if let Some(ref policy) = self.stop_policy {
            settings.stop_policy = policy.parse()?;
        }
        if let Some(include) = self.include_images {
            settings.include_images = include;
        }
        if let Some(secs) = self.image_timeout {
            settings.image_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = self.max_image_bytes {
            settings.max_image_bytes = bytes;
        }
        if let Some(ref model) = self.model {
            settings.model = model.clone();
        }
        if let Some(ref url) = self.api_base_url {
            settings.api_base_url = url.clone();
        }
        if let Some(secs) = self.request_timeout {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ref template) = self.prompt_template {
            settings.prompt_template = template.clone();
        }
        if let Some(capacity) = self.log_capacity {
            settings.log_capacity = capacity;
        }
        Ok(())
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Use CWD for relative paths instead of config file directory.
    pub use_cwd: bool,
    /// Output directory override (--output flag).
    pub output_dir: Option<PathBuf>,
}

/// Load settings with explicit options.
/// Returns (Settings, Config) tuple.
pub async fn load_settings_with_options(options: LoadOptions) -> Result<(Settings, Config), String> {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    let mut settings = Settings::default();

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let base_dir = if options.use_cwd {
        cwd.clone()
    } else {
        config.base_dir().unwrap_or_else(|| cwd.clone())
    };

    config.apply_to_settings(&mut settings, &base_dir)?;

    if let Some(dir) = options.output_dir {
        settings.output_dir = dir;
    }
    if settings.output_dir.is_relative() {
        settings.output_dir = cwd.join(&settings.output_dir);
    }

    // API key only ever comes from the environment
    settings.api_key = api_key_from_env();

    Ok((settings, config))
}

/// Load settings using auto-discovered configuration.
pub async fn load_settings() -> Result<(Settings, Config), String> {
    load_settings_with_options(LoadOptions::default()).await
}
