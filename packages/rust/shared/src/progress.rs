//! Append-only structured run log.
//!
//! [`ProgressLog`] is shared by reference across scraper workers and the
//! scoring loop. Every append is mirrored to `tracing` and, when attached,
//! forwarded to a [`LogSink`] so a front end can render live progress.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Monotonic seconds since the log was created.
    pub elapsed_seconds: f64,
    /// Overall completion, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

/// Receives each entry as it is appended.
pub trait LogSink: Send + Sync {
    fn on_entry(&self, entry: &LogEntry);
}

/// Synchronized append-only progress log.
pub struct ProgressLog {
    entries: Mutex<Vec<LogEntry>>,
    started: Instant,
    sink: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for ProgressLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressLog")
            .field("entries", &self.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            started: Instant::now(),
            sink: None,
        }
    }

    /// Create a log that forwards every entry to `sink`.
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Append an entry. `progress` is clamped to 100.
    ///
    /// The entry is stamped and forwarded under the lock, so the sink sees
    /// entries in stored order. Sinks must not append to the log.
    pub fn log(&self, message: impl Into<String>, level: LogLevel, progress: Option<u8>) {
        let message = message.into();
        // A panicking writer cannot leave a half-pushed Vec, so poison is safe to clear.
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());

        let entry = LogEntry {
            message,
            level,
            timestamp: Utc::now(),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            progress: progress.map(|p| p.min(100)),
        };

        match level {
            LogLevel::Info => tracing::info!(progress = ?entry.progress, "{}", entry.message),
            LogLevel::Warning => tracing::warn!(progress = ?entry.progress, "{}", entry.message),
            LogLevel::Error => tracing::error!(progress = ?entry.progress, "{}", entry.message),
        }

        if let Some(sink) = &self.sink {
            sink.on_entry(&entry);
        }
        guard.push(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Info, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Warning, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Error, None);
    }

    /// Info entry carrying a progress percentage.
    pub fn progress(&self, message: impl Into<String>, percent: u8) {
        self.log(message, LogLevel::Info, Some(percent));
    }

    /// Snapshot of everything appended so far, in append order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink(Mutex<usize>);

    impl LogSink for CountingSink {
        fn on_entry(&self, _entry: &LogEntry) {
            *self.0.lock().expect("lock") += 1;
        }
    }

    #[test]
    fn entries_keep_append_order() {
        let log = ProgressLog::new();
        log.info("first");
        log.warn("second");
        log.progress("third", 150);

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].level, LogLevel::Warning);
        assert_eq!(entries[2].progress, Some(100));
        assert!(entries[0].elapsed_seconds <= entries[2].elapsed_seconds);
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let log = Arc::new(ProgressLog::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        log.info(format!("worker {i} step {j}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(log.len(), 400);
    }

    #[test]
    fn sink_sees_every_entry() {
        let sink = Arc::new(CountingSink(Mutex::new(0)));
        let log = ProgressLog::with_sink(sink.clone());
        log.info("a");
        log.error("b");
        assert_eq!(*sink.0.lock().expect("lock"), 2);
    }

    struct RecordingSink(Mutex<Vec<String>>);

    impl LogSink for RecordingSink {
        fn on_entry(&self, entry: &LogEntry) {
            self.0.lock().expect("lock").push(entry.message.clone());
        }
    }

    #[test]
    fn sink_and_elapsed_follow_append_order_under_contention() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let log = Arc::new(ProgressLog::with_sink(sink.clone()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        log.info(format!("worker {i} step {j}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }

        let entries = log.entries();
        let stored: Vec<String> = entries.iter().map(|e| e.message.clone()).collect();
        assert_eq!(*sink.0.lock().expect("lock"), stored);
        assert!(
            entries
                .windows(2)
                .all(|w| w[0].elapsed_seconds <= w[1].elapsed_seconds)
        );
    }

    #[test]
    fn level_serializes_lowercase() {
        let json = serde_json::to_string(&LogLevel::Warning).expect("serialize");
        assert_eq!(json, "\"warning\"");
    }
}
