//! Runtime context shared by runners.
//!
//! Holds what would otherwise be process-wide state: the default dry-run
//! value, logging switch, default error level, and the opt-in command
//! history. The application builds one at startup and hands an `Arc` to
//! each runner; tests build a fresh one per case.
//!
//! Only the history is guarded for concurrent mutation. The other switches
//! are atomics meant to be set once before runners start; flipping them
//! while runs are in flight is allowed but not coordinated with those runs.

use crate::logging::{LogSink, NullSink, TracingSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use subproc_core::{CommandHistory, Config, LogLevel};

#[derive(Debug)]
pub struct Context {
    default_dry_run: AtomicBool,
    logging_enabled: AtomicBool,
    save_history: AtomicBool,
    default_error_log_level: RwLock<LogLevel>,
    history: Mutex<CommandHistory>,
    sink: Arc<dyn LogSink>,
}

impl Default for Context {
    fn default() -> Self {
        Self::with_sink(Arc::new(TracingSink))
    }
}

impl Context {
    /// Fresh context logging through `tracing`, with logging disabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self {
            default_dry_run: AtomicBool::new(false),
            logging_enabled: AtomicBool::new(false),
            save_history: AtomicBool::new(false),
            default_error_log_level: RwLock::new(LogLevel::DEFAULT_ERROR),
            history: Mutex::new(CommandHistory::default()),
            sink,
        }
    }

    /// Context that discards every message.
    pub fn silent() -> Self {
        Self::with_sink(Arc::new(NullSink))
    }

    /// Build a context from loaded configuration.
    pub fn from_config(config: &Config, sink: Arc<dyn LogSink>) -> Self {
        let context = Self::with_sink(sink);
        context.set_default_dry_run(config.dry_run);
        context.set_logging(config.logging);
        context.set_save_history(config.save_history);
        context.set_history_capacity(config.history_size);
        context.set_default_error_log_level(config.error_log_level);
        context
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    pub fn default_dry_run(&self) -> bool {
        self.default_dry_run.load(Ordering::Relaxed)
    }

    pub fn set_default_dry_run(&self, dry_run: bool) {
        self.default_dry_run.store(dry_run, Ordering::Relaxed);
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging_enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable all runner logging through this context.
    pub fn set_logging(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn default_error_log_level(&self) -> LogLevel {
        *self
            .default_error_log_level
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_default_error_log_level(&self, level: LogLevel) {
        *self
            .default_error_log_level
            .write()
            .unwrap_or_else(PoisonError::into_inner) = level;
    }

    pub fn save_history(&self) -> bool {
        self.save_history.load(Ordering::Relaxed)
    }

    pub fn set_save_history(&self, enabled: bool) {
        self.save_history.store(enabled, Ordering::Relaxed);
    }

    pub fn history_capacity(&self) -> usize {
        self.lock_history().capacity()
    }

    pub fn set_history_capacity(&self, capacity: usize) {
        self.lock_history().set_capacity(capacity);
    }

    /// Snapshot of recorded commands, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.lock_history().to_vec()
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
    }

    /// Record one executed attempt. No-op unless history saving is enabled.
    pub(crate) fn record(&self, command: &str) {
        if self.save_history() {
            self.lock_history().push(command);
        }
    }

    /// Forward to the sink when logging is enabled.
    pub(crate) fn log(&self, level: LogLevel, message: &str) {
        if level != LogLevel::Quiet && self.logging_enabled() {
            self.sink.log(level, message);
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, CommandHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
