//! subproc - retry-aware external command execution.
//!
//! A [`Runner`] executes one command (shell line or argv), captures its
//! output, and optionally retries failures with exponential backoff. Shared
//! switches (dry run, logging, history) live on a [`Context`].

pub mod context;
pub mod decode;
pub mod logging;
pub mod retry;
pub mod runner;
pub mod which;

pub use context::Context;
pub use decode::{decode_output, encode_input, EncodingError};
pub use logging::{LogSink, MemorySink, NullSink, TracingSink};
pub use retry::{RetryError, RetryPolicy};
pub use runner::{
    CompletedOutput, Input, PopenOptions, RunOptions, Runner, RunnerError, RunnerOptions, Spawned,
};
pub use subproc_core::{Command, CommandError, Config, LogLevel};
pub use which::Which;
