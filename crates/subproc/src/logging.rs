//! Log sinks the runner reports through.
//!
//! The runner never calls a logging backend directly; it is handed a
//! [`LogSink`] and picks the severity per message.

use subproc_core::LogLevel;

/// Destination for runner messages.
pub trait LogSink: Send + Sync + std::fmt::Debug {
    fn log(&self, level: LogLevel, message: &str);

    fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn success(&self, message: &str) {
        self.log(LogLevel::Success, message);
    }

    fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    fn critical(&self, message: &str) {
        self.log(LogLevel::Critical, message);
    }
}

/// Forwards messages to `tracing` under the `subproc` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Quiet => {}
            LogLevel::Trace => tracing::trace!(target: "subproc", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "subproc", "{message}"),
            LogLevel::Info | LogLevel::Success => tracing::info!(target: "subproc", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "subproc", "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(target: "subproc", "{message}");
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Collects messages in memory. Useful for asserting on runner output.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn records(&self) -> Vec<(LogLevel, String)> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Messages logged at exactly `level`.
    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str) {
        if level == LogLevel::Quiet {
            return;
        }
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((level, message.to_string()));
    }
}
