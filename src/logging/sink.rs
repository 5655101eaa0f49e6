//! Log sink implementations.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{LogEntry, LogLevel};

/// Destination for pipeline log entries.
pub trait LogSink: Send + Sync {
    fn record(&self, entry: &LogEntry);
}

/// Forwards entries to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, entry: &LogEntry) {
        let chunk = entry.chunk_index.map(|i| i + 1);
        let job = entry.job_id.as_deref().unwrap_or("");
        match entry.level {
            LogLevel::Debug => {
                tracing::debug!(category = %entry.category, chunk = ?chunk, job, "{}", entry.message)
            }
            LogLevel::Info => {
                tracing::info!(category = %entry.category, chunk = ?chunk, job, "{}", entry.message)
            }
            LogLevel::Warn => {
                tracing::warn!(category = %entry.category, chunk = ?chunk, job, "{}", entry.message)
            }
            LogLevel::Error => {
                tracing::error!(category = %entry.category, chunk = ?chunk, job, "{}", entry.message)
            }
        }
    }
}

/// Bounded in-memory ring buffer of recent entries.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemorySink {
    /// Default number of entries retained.
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Snapshot of retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Entries at or above `level`, optionally restricted to one category.
    pub fn filtered(&self, level: LogLevel, category: Option<&str>) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level >= level)
            .filter(|e| category.map_or(true, |c| e.category.eq_ignore_ascii_case(c)))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl LogSink for MemorySink {
    fn record(&self, entry: &LogEntry) {
        let mut guard = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::PipelineLogger;
    use std::sync::Arc;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let sink = Arc::new(MemorySink::new(2));
        let logger = PipelineLogger::new(vec![sink.clone()]);

        logger.info("A", "first");
        logger.info("A", "second");
        logger.info("A", "third");

        let messages: Vec<String> = sink.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["second", "third"]);
    }

    #[test]
    fn test_filtered_by_level_and_category() {
        let sink = Arc::new(MemorySink::default());
        let logger = PipelineLogger::new(vec![sink.clone()]);

        logger.debug("POLL", "tick");
        logger.error("POLL", "failed");
        logger.error("IMAGE", "timeout");

        let errors = sink.filtered(LogLevel::Error, Some("poll"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "failed");
    }
}
