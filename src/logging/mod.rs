//! Pipeline logging with injectable sinks.
//!
//! Pipeline components receive a `PipelineLogger` instead of reaching for a
//! global. Production wires in `TracingSink`; tests and the log viewer
//! endpoint read back from a `MemorySink`.

mod sink;

pub use sink::{LogSink, MemorySink, TracingSink};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// A single structured log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Subsystem tag, e.g. `PIPELINE`, `POLL`, `IMAGE`.
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Cloneable logging handle passed into pipeline components.
#[derive(Clone)]
pub struct PipelineLogger {
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
    min_level: LogLevel,
    next_id: Arc<AtomicU64>,
}

impl PipelineLogger {
    /// Create a logger that writes to the given sinks.
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
            min_level: LogLevel::Debug,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Logger that forwards everything to `tracing`.
    pub fn tracing() -> Self {
        Self::new(vec![Arc::new(TracingSink)])
    }

    /// Logger that discards everything.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Drop entries below `level`.
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Start building an entry scoped to a chunk.
    pub fn chunk(&self, chunk_index: usize) -> ScopedLogger<'_> {
        ScopedLogger {
            logger: self,
            chunk_index: Some(chunk_index),
            job_id: None,
        }
    }

    pub fn log(&self, level: LogLevel, category: &str, message: impl Into<String>) {
        self.emit(level, category, message.into(), None, None);
    }

    pub fn debug(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, category, message);
    }

    pub fn info(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, category, message);
    }

    pub fn warn(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, category, message);
    }

    pub fn error(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, category, message);
    }

    fn emit(
        &self,
        level: LogLevel,
        category: &str,
        message: String,
        chunk_index: Option<usize>,
        job_id: Option<String>,
    ) {
        if level < self.min_level || self.sinks.is_empty() {
            return;
        }
        let entry = LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message,
            chunk_index,
            job_id,
        };
        for sink in self.sinks.iter() {
            sink.record(&entry);
        }
    }
}

impl Default for PipelineLogger {
    fn default() -> Self {
        Self::tracing()
    }
}

/// Borrowed logger carrying chunk/job context.
pub struct ScopedLogger<'a> {
    logger: &'a PipelineLogger,
    chunk_index: Option<usize>,
    job_id: Option<String>,
}

impl ScopedLogger<'_> {
    pub fn job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn log(self, level: LogLevel, category: &str, message: impl Into<String>) {
        self.logger
            .emit(level, category, message.into(), self.chunk_index, self.job_id);
    }

    pub fn debug(self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, category, message);
    }

    pub fn info(self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, category, message);
    }

    pub fn warn(self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, category, message);
    }

    pub fn error(self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, category, message);
    }
}
