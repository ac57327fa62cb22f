//! Terminal rendering of the run log.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use oppscout_shared::{LogEntry, LogLevel, LogSink};

/// Feeds [`LogEntry`] appends into an indicatif bar on stderr.
pub(crate) struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl LogSink for CliProgress {
    fn on_entry(&self, entry: &LogEntry) {
        if let Some(pct) = entry.progress {
            self.bar.set_position(u64::from(pct));
        }
        match entry.level {
            LogLevel::Info => self.bar.set_message(entry.message.clone()),
            LogLevel::Warning | LogLevel::Error => self.bar.println(format!(
                "  [{:>7.1}s] {}: {}",
                entry.elapsed_seconds, entry.level, entry.message
            )),
        }
    }
}
