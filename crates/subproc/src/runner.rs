//! Runner module for executing external commands with optional retries.
//!
//! Key responsibilities:
//! - Verify the executable is reachable before spawning
//! - Short-circuit dry runs without touching the OS
//! - Capture and decode stdout/stderr, record the exit code
//! - Drive the retry loop with [`RetryPolicy`] and decide whether to raise
//!
//! Captured output and the exit code are overwritten by every attempt, so
//! after a retried run they always describe the last attempt made.

use crate::context::Context;
use crate::decode::{decode_output, encode_input, EncodingError};
use crate::logging::LogSink;
use crate::retry::RetryPolicy;
use crate::which::Which;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use subproc_core::{Command, CommandError, Config, LogLevel};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

/// Placeholder stored as stdout/stderr by dry runs.
pub const DRY_RUN_OUTPUT: &str = "";

/// Encoding applied to text input when none is given.
pub const DEFAULT_ENCODING: &str = "ascii";

/// Upper bound on draining stdout/stderr once the child has exited.
///
/// A grandchild that inherited the pipes can keep them open after the
/// direct child is gone. Whatever was read by then is kept.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("command '{command}' returned non-zero exit status {exit_code}")]
    ProcessFailed {
        exit_code: i32,
        command: String,
        stdout: String,
        stderr: String,
    },
    #[error("command '{command}' timed out after {:.2} seconds", .timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Data written to the child's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Encoded with [`RunOptions::encoding`] before sending.
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Input {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Input {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

/// Per-call options for [`Runner::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: Option<Input>,
    /// Encoding for text input (default `ascii`).
    pub encoding: Option<String>,
    /// Limit for each individual attempt.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    /// Return `ProcessFailed` instead of the exit code on final failure.
    pub check: bool,
    /// Replaces the inherited environment entirely.
    pub env: Option<HashMap<String, String>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout and encoding from a loaded config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.timeout(),
            encoding: Some(config.encoding.clone()),
            ..Self::default()
        }
    }

    pub fn input(mut self, input: impl Into<Input>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    fn encoded_input(&self) -> std::result::Result<Option<Vec<u8>>, EncodingError> {
        match &self.input {
            None => Ok(None),
            Some(Input::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Input::Text(text)) => {
                encode_input(text, self.encoding.as_deref().unwrap_or(DEFAULT_ENCODING)).map(Some)
            }
        }
    }
}

/// Options for [`Runner::popen`].
#[derive(Debug, Clone, Default)]
pub struct PopenOptions {
    /// Pipe stdin instead of inheriting it.
    pub pipe_stdin: bool,
    pub env: Option<HashMap<String, String>>,
}

/// Construction-time runner settings.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// `None` inherits the context's default.
    pub dry_run: Option<bool>,
    /// Failures whose stderr matches are returned without logging or raising.
    pub ignore_stderr: Option<Regex>,
    /// Suppress debug and failure messages from this runner.
    pub quiet: bool,
    /// `None` inherits the context's default error level.
    pub error_log_level: Option<LogLevel>,
}

/// Decoded result of a finished child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CompletedOutput {
    fn dry_run() -> Self {
        Self {
            returncode: 0,
            stdout: DRY_RUN_OUTPUT.to_string(),
            stderr: DRY_RUN_OUTPUT.to_string(),
        }
    }
}

/// Handle returned by [`Runner::popen`].
#[derive(Debug)]
pub enum Spawned {
    /// A live child; stdout and stderr are piped.
    Child(Child),
    /// Nothing was spawned; carries the dry-run placeholder values.
    DryRun(CompletedOutput),
}

impl Spawned {
    pub fn child_mut(&mut self) -> Option<&mut Child> {
        match self {
            Self::Child(child) => Some(child),
            Self::DryRun(_) => None,
        }
    }

    pub fn into_child(self) -> Option<Child> {
        match self {
            Self::Child(child) => Some(child),
            Self::DryRun(_) => None,
        }
    }

    /// Write `input` to stdin (when it was piped), wait, and decode the output.
    pub async fn communicate(self, input: Option<&[u8]>) -> io::Result<CompletedOutput> {
        let mut child = match self {
            Self::DryRun(output) => return Ok(output),
            Self::Child(child) => child,
        };

        let writer = child.stdin.take().map(|stdin| {
            let data = input.map(<[u8]>::to_vec).unwrap_or_default();
            tokio::spawn(feed_stdin(stdin, data))
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            writer.await.map_err(io::Error::other)??;
        }

        Ok(CompletedOutput {
            returncode: exit_code(output.status),
            stdout: decode_output(&output.stdout),
            stderr: decode_output(&output.stderr),
        })
    }
}

/// How a single attempt's non-zero exit was classified.
enum Failure {
    /// stderr matched the ignore pattern.
    Ignored,
    /// Logged as a failure.
    Reported,
}

/// Runs one command, possibly several times.
#[derive(Debug)]
pub struct Runner {
    command: Command,
    context: Arc<Context>,
    dry_run: bool,
    ignore_stderr: Option<Regex>,
    quiet: bool,
    error_log_level: LogLevel,
    stdout: Option<String>,
    stderr: Option<String>,
    returncode: Option<i32>,
}

impl Runner {
    pub fn new(command: Command, context: Arc<Context>) -> Self {
        Self::with_options(command, context, RunnerOptions::default())
    }

    pub fn with_options(command: Command, context: Arc<Context>, options: RunnerOptions) -> Self {
        let dry_run = options.dry_run.unwrap_or_else(|| context.default_dry_run());
        let error_log_level = options
            .error_log_level
            .unwrap_or_else(|| context.default_error_log_level());

        Self {
            command,
            context,
            dry_run,
            ignore_stderr: options.ignore_stderr,
            quiet: options.quiet,
            error_log_level,
            stdout: None,
            stderr: None,
            returncode: None,
        }
    }

    /// Runner for a shell-interpreted command line.
    pub fn shell(context: Arc<Context>, line: impl Into<String>) -> std::result::Result<Self, CommandError> {
        Ok(Self::new(Command::shell(line)?, context))
    }

    /// Runner for an argv command executed without a shell.
    pub fn argv<I, S>(context: Arc<Context>, args: I) -> std::result::Result<Self, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self::new(Command::argv(args)?, context))
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn command_str(&self) -> String {
        self.command.to_command_string()
    }

    pub fn is_shell(&self) -> bool {
        self.command.is_shell()
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn error_log_level(&self) -> LogLevel {
        self.error_log_level
    }

    pub fn set_error_log_level(&mut self, level: LogLevel) {
        self.error_log_level = level;
    }

    /// Decoded stdout of the last attempt, `None` before the first run.
    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// Run to completion and return the last attempt's exit code.
    ///
    /// Without a retry policy a failure is final after one attempt. With one,
    /// the command is re-run up to `total` more times until it exits 0 or
    /// with a no-retry code. A failure whose stderr matches the ignore
    /// pattern is returned as-is and never retried or raised. Timeouts
    /// propagate immediately, even mid-retry.
    pub async fn run(&mut self, options: RunOptions) -> Result<i32> {
        self.verify_command()?;

        if self.dry_run {
            return Ok(self.dry_run_short_circuit());
        }

        let input = options.encoded_input()?;
        let env = options.env.as_ref();

        let mut exit_code = self.execute(input.as_deref(), env, options.timeout).await?;
        if exit_code == 0 {
            return Ok(0);
        }
        if let Failure::Ignored = self.classify_failure(exit_code) {
            return Ok(exit_code);
        }

        let Some(retry) = options.retry.as_ref() else {
            return self.finish(exit_code, options.check);
        };
        if retry.is_no_retry(exit_code) {
            return Ok(exit_code);
        }

        let target = self.command_str();
        for attempt in 1..=retry.total() {
            let logger = self.logger();
            retry
                .wait_before_retry(attempt, Some(&logger), Some(&target))
                .await;

            exit_code = self.execute(input.as_deref(), env, options.timeout).await?;
            if exit_code == 0 {
                return Ok(0);
            }
            if let Failure::Ignored = self.classify_failure(exit_code) {
                return Ok(exit_code);
            }
            if retry.is_no_retry(exit_code) {
                return Ok(exit_code);
            }
        }

        self.finish(exit_code, options.check)
    }

    /// Spawn without waiting. The caller owns the child's lifecycle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn popen(&mut self, options: PopenOptions) -> Result<Spawned> {
        self.verify_command()?;

        if self.dry_run {
            self.dry_run_short_circuit();
            return Ok(Spawned::DryRun(CompletedOutput::dry_run()));
        }

        let command_str = self.command_str();
        self.logger().debug(&command_str);
        self.context.record(&command_str);

        let mut process = self.build_process(options.env.as_ref())?;
        process
            .stdin(if options.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = process.spawn().map_err(|e| self.spawn_error(e))?;
        Ok(Spawned::Child(child))
    }

    /// Fail before spawning if the command is empty or its executable can't
    /// be found. Lookup is skipped for dry runs and on Windows, where shell
    /// builtins like `dir` are not on the search path.
    fn verify_command(&self) -> std::result::Result<(), CommandError> {
        let program = self.command.program();
        if program.is_empty() {
            return Err(CommandError::invalid(self.command_str()));
        }

        if self.dry_run || cfg!(windows) {
            return Ok(());
        }

        Which::new(program)?.verify()
    }

    fn dry_run_short_circuit(&mut self) -> i32 {
        let output = CompletedOutput::dry_run();
        self.stdout = Some(output.stdout);
        self.stderr = Some(output.stderr);
        self.returncode = Some(output.returncode);

        let command_str = self.command_str();
        self.logger().debug(&format!("dry-run: {command_str}"));
        self.context.record(&command_str);

        output.returncode
    }

    /// One attempt: spawn, feed stdin, wait (bounded by `limit`), capture.
    async fn execute(
        &mut self,
        input: Option<&[u8]>,
        env: Option<&HashMap<String, String>>,
        limit: Option<Duration>,
    ) -> Result<i32> {
        self.stdout = None;
        self.stderr = None;
        self.returncode = None;

        let command_str = self.command_str();
        self.logger().debug(&command_str);
        self.context.record(&command_str);

        let mut process = self.build_process(env)?;
        process
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|e| self.spawn_error(e))?;

        let stdin_task = child.stdin.take().map(|stdin| {
            let data = input.map(<[u8]>::to_vec).unwrap_or_default();
            tokio::spawn(feed_stdin(stdin, data))
        });
        let stdout_capture = child.stdout.take().map(OutputCapture::spawn);
        let stderr_capture = child.stderr.take().map(OutputCapture::spawn);

        let status = match limit {
            Some(limit) => {
                if let Ok(status) = timeout(limit, child.wait()).await {
                    status?
                } else {
                    if let Err(err) = child.kill().await {
                        warn!(command = %command_str, error = %err, "failed to kill timed-out process");
                    }
                    for capture in [stdout_capture, stderr_capture].into_iter().flatten() {
                        capture.abort();
                    }
                    return Err(RunnerError::Timeout {
                        command: command_str,
                        timeout: limit,
                    });
                }
            }
            None => child.wait().await?,
        };

        if let Some(task) = stdin_task {
            match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => warn!(command = %command_str, error = %err, "stdin write failed"),
                Ok(Err(err)) => warn!(command = %command_str, error = %err, "stdin task panicked"),
                Err(_) => warn!(command = %command_str, "stdin write timed out"),
            }
        }
        let (stdout, stderr) = tokio::join!(
            OutputCapture::finish(stdout_capture, "stdout"),
            OutputCapture::finish(stderr_capture, "stderr"),
        );

        let code = exit_code(status);
        self.stdout = Some(decode_output(&stdout));
        self.stderr = Some(decode_output(&stderr));
        self.returncode = Some(code);

        Ok(code)
    }

    fn build_process(&self, env: Option<&HashMap<String, String>>) -> Result<ProcessCommand> {
        let mut process = match &self.command {
            Command::Shell(line) => {
                let (shell, flag) = shell_program();
                let mut process = ProcessCommand::new(shell);
                process.arg(flag).arg(line);
                process
            }
            Command::Argv(args) => {
                let Some((program, rest)) = args.split_first() else {
                    return Err(CommandError::invalid(self.command_str()).into());
                };
                let mut process = ProcessCommand::new(program);
                process.args(rest);
                process
            }
        };

        match env {
            Some(env) => {
                process.env_clear().envs(env);
            }
            None => {
                if cfg!(unix) {
                    process.env("LC_ALL", "C");
                }
            }
        }

        Ok(process)
    }

    fn spawn_error(&self, err: io::Error) -> RunnerError {
        if err.kind() == io::ErrorKind::NotFound {
            CommandError::not_found(self.command.program()).into()
        } else {
            RunnerError::Io(err)
        }
    }

    fn classify_failure(&self, exit_code: i32) -> Failure {
        let stderr = self.stderr.as_deref().unwrap_or_default();
        if self
            .ignore_stderr
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(stderr))
        {
            return Failure::Ignored;
        }

        self.logger().log(
            self.error_log_level,
            &format!(
                "command='{}', returncode={exit_code}, stderr={stderr:?}",
                self.command_str()
            ),
        );
        Failure::Reported
    }

    fn finish(&self, exit_code: i32, check: bool) -> Result<i32> {
        if !check {
            return Ok(exit_code);
        }
        Err(RunnerError::ProcessFailed {
            exit_code,
            command: self.command_str(),
            stdout: self.stdout.clone().unwrap_or_default(),
            stderr: self.stderr.clone().unwrap_or_default(),
        })
    }

    fn logger(&self) -> RunnerLog {
        RunnerLog {
            context: Arc::clone(&self.context),
            quiet: self.quiet,
        }
    }
}

/// The runner's view of the context sink, silenced when the runner is quiet.
#[derive(Debug)]
struct RunnerLog {
    context: Arc<Context>,
    quiet: bool,
}

impl LogSink for RunnerLog {
    fn log(&self, level: LogLevel, message: &str) {
        if !self.quiet {
            self.context.log(level, message);
        }
    }
}

fn shell_program() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

/// Exit code, or the negated signal number for a child killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Write `data` and close stdin. A child that exits without reading is not an error.
async fn feed_stdin(mut stdin: ChildStdin, data: Vec<u8>) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match stdin.write_all(&data).await {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Drains one child pipe into a buffer that outlives the reader task.
struct OutputCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<io::Result<()>>,
}

impl OutputCapture {
    fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::with_capacity(8192)));
        let task = tokio::spawn(read_chunks(reader, Arc::clone(&buf)));
        Self { buf, task }
    }

    /// Wait for EOF up to `IO_CAPTURE_TIMEOUT`, then return what was read.
    async fn finish(capture: Option<Self>, stream: &str) -> Vec<u8> {
        let Some(mut capture) = capture else {
            return Vec::new();
        };
        match timeout(IO_CAPTURE_TIMEOUT, &mut capture.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(stream, error = %err, "output capture failed"),
            Ok(Err(err)) => warn!(stream, error = %err, "output capture task panicked"),
            Err(_) => {
                warn!(stream, "output capture timed out, keeping partial output");
                capture.task.abort();
            }
        }
        capture.take()
    }

    fn abort(self) {
        self.task.abort();
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

async fn read_chunks<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn context() -> Arc<Context> {
        Context::silent().into_shared()
    }

    fn logged_context() -> (Arc<Context>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let context = Context::with_sink(Arc::clone(&sink) as Arc<dyn LogSink>);
        context.set_logging(true);
        (context.into_shared(), sink)
    }

    fn fast_retry(total: u32) -> RetryPolicy {
        RetryPolicy::new(total, 0.01, 0.01).unwrap()
    }

    /// Script that bumps a counter file on every invocation, then runs `body`.
    fn counting_script(dir: &TempDir, body: &str) -> (PathBuf, PathBuf) {
        let counter = dir.path().join("counter");
        let script = dir.path().join("script.sh");
        std::fs::write(&counter, "0").unwrap();
        std::fs::write(
            &script,
            format!(
                "n=$(cat \"{counter}\")\nn=$((n + 1))\necho $n > \"{counter}\"\n{body}\n",
                counter = counter.display()
            ),
        )
        .unwrap();
        (script, counter)
    }

    fn invocations(counter: &Path) -> u32 {
        std::fs::read_to_string(counter)
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[test]
    fn new_runner_has_no_captured_state() {
        let runner = Runner::shell(context(), "echo test").unwrap();
        assert!(runner.stdout().is_none());
        assert!(runner.stderr().is_none());
        assert!(runner.returncode().is_none());
        assert!(runner.is_shell());
        assert_eq!(runner.command_str(), "echo test");
    }

    #[test]
    fn empty_command_fails_at_construction() {
        assert!(Runner::shell(context(), "").is_err());
        assert!(Runner::argv(context(), Vec::<String>::new()).is_err());
    }

    #[test]
    fn dry_run_inherits_context_default() {
        let context = context();
        context.set_default_dry_run(true);

        let inherited = Runner::shell(Arc::clone(&context), "ls").unwrap();
        assert!(inherited.dry_run());

        let overridden = Runner::with_options(
            Command::shell("ls").unwrap(),
            context,
            RunnerOptions {
                dry_run: Some(false),
                ..RunnerOptions::default()
            },
        );
        assert!(!overridden.dry_run());
    }

    #[test]
    fn error_log_level_inherits_context_default() {
        let context = context();
        context.set_default_error_log_level(LogLevel::Error);
        let mut runner = Runner::shell(context, "ls").unwrap();
        assert_eq!(runner.error_log_level(), LogLevel::Error);

        runner.set_error_log_level(LogLevel::Critical);
        assert_eq!(runner.error_log_level(), LogLevel::Critical);
    }

    #[test]
    fn verify_rejects_degenerate_shell_line() {
        let runner = Runner::shell(context(), "( ls").unwrap();
        let err = runner.verify_command().unwrap_err();
        assert!(matches!(err, CommandError::Invalid { .. }));
    }

    #[test]
    fn verify_rejects_directly_built_empty_argv() {
        let runner = Runner::new(Command::Argv(Vec::new()), context());
        assert!(matches!(
            runner.verify_command(),
            Err(CommandError::Invalid { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn verify_checks_shell_leading_token() {
        let found = Runner::shell(context(), "(sh -c 'exit 0')").unwrap();
        found.verify_command().unwrap();

        let missing = Runner::shell(context(), "__not_exist_command__ --flag").unwrap();
        assert!(matches!(
            missing.verify_command(),
            Err(CommandError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_command_fails_before_spawn() {
        let context = context();
        context.set_save_history(true);
        let mut runner = Runner::argv(Arc::clone(&context), ["__not_exist_command__"]).unwrap();

        let err = runner.run(RunOptions::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Command(CommandError::NotFound { .. })
        ));
        assert!(runner.returncode().is_none());
        assert!(context.history().is_empty());
    }

    #[tokio::test]
    async fn dry_run_skips_verification_and_execution() {
        let context = context();
        context.set_save_history(true);
        let mut runner = Runner::with_options(
            Command::argv(["__not_exist_command__", "arg"]).unwrap(),
            Arc::clone(&context),
            RunnerOptions {
                dry_run: Some(true),
                ..RunnerOptions::default()
            },
        );

        let code = runner
            .run(RunOptions::new().check(true).retry(fast_retry(3)))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(runner.stdout(), Some(DRY_RUN_OUTPUT));
        assert_eq!(runner.stderr(), Some(DRY_RUN_OUTPUT));
        assert_eq!(runner.returncode(), Some(0));
        assert_eq!(context.history(), vec!["__not_exist_command__ arg"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dry_run_logs_command() {
        let (context, sink) = logged_context();
        let mut runner = Runner::with_options(
            Command::shell("ls -l").unwrap(),
            context,
            RunnerOptions {
                dry_run: Some(true),
                ..RunnerOptions::default()
            },
        );
        runner.run(RunOptions::new()).await.unwrap();
        assert_eq!(sink.messages_at(LogLevel::Debug), vec!["dry-run: ls -l"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let mut runner =
            Runner::shell(context(), "echo out; echo err 1>&2; exit 3").unwrap();
        let code = runner.run(RunOptions::new()).await.unwrap();

        assert_eq!(code, 3);
        assert_eq!(runner.returncode(), Some(3));
        assert_eq!(runner.stdout().unwrap().trim(), "out");
        assert_eq!(runner.stderr().unwrap().trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn default_environment_forces_c_locale() {
        let mut runner = Runner::shell(context(), "echo $LC_ALL").unwrap();
        runner.run(RunOptions::new()).await.unwrap();
        assert_eq!(runner.stdout().unwrap().trim(), "C");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn explicit_environment_replaces_inherited() {
        let mut env = HashMap::new();
        env.insert("SUBPROC_TEST_VALUE".to_string(), "hello".to_string());

        let sh = Which::new("sh").unwrap().locate().unwrap();
        let mut runner = Runner::argv(
            context(),
            [
                sh.to_string_lossy().into_owned(),
                "-c".to_string(),
                "echo \"$SUBPROC_TEST_VALUE:$LC_ALL\"".to_string(),
            ],
        )
        .unwrap();
        runner.run(RunOptions::new().env(env)).await.unwrap();
        assert_eq!(runner.stdout().unwrap().trim(), "hello:");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn text_input_is_encoded_and_piped() {
        let mut runner = Runner::shell(context(), "cat").unwrap();
        runner
            .run(RunOptions::new().input("caf\u{e9}").encoding("latin-1"))
            .await
            .unwrap();
        // latin-1 byte 0xe9 is not valid UTF-8 on the way back.
        assert_eq!(runner.stdout(), Some("caf\u{fffd}"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unencodable_input_fails_before_spawn() {
        let context = context();
        context.set_save_history(true);
        let mut runner = Runner::shell(Arc::clone(&context), "cat").unwrap();

        let err = runner
            .run(RunOptions::new().input("caf\u{e9}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Encoding(_)));
        assert!(context.history().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ignore_pattern_suppresses_log_and_check() {
        let (context, sink) = logged_context();
        let mut runner = Runner::with_options(
            Command::shell("echo 'benign warning' 1>&2; exit 1").unwrap(),
            context,
            RunnerOptions {
                ignore_stderr: Some(Regex::new("benign").unwrap()),
                ..RunnerOptions::default()
            },
        );

        let code = runner.run(RunOptions::new().check(true)).await.unwrap();
        assert_eq!(code, 1);
        assert!(sink.messages_at(LogLevel::Warning).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ignore_pattern_stops_retrying() {
        let dir = TempDir::new().unwrap();
        let (script, counter) = counting_script(&dir, "echo 'known issue' 1>&2\nexit 1");
        let mut runner = Runner::with_options(
            Command::argv(["sh".to_string(), script.display().to_string()]).unwrap(),
            context(),
            RunnerOptions {
                ignore_stderr: Some(Regex::new("known issue").unwrap()),
                ..RunnerOptions::default()
            },
        );

        let code = runner
            .run(RunOptions::new().retry(fast_retry(3)).check(true))
            .await
            .unwrap();
        assert_eq!(code, 1);
        assert_eq!(invocations(&counter), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_is_logged_at_error_level() {
        let (context, sink) = logged_context();
        let mut runner = Runner::with_options(
            Command::shell("echo boom 1>&2; exit 4").unwrap(),
            context,
            RunnerOptions {
                error_log_level: Some(LogLevel::Error),
                ..RunnerOptions::default()
            },
        );
        runner.run(RunOptions::new()).await.unwrap();

        assert_eq!(
            sink.messages_at(LogLevel::Error),
            vec!["command='echo boom 1>&2; exit 4', returncode=4, stderr=\"boom\\n\""]
        );
        assert_eq!(
            sink.messages_at(LogLevel::Debug),
            vec!["echo boom 1>&2; exit 4"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn quiet_runner_logs_nothing() {
        let (context, sink) = logged_context();
        let mut runner = Runner::with_options(
            Command::shell("false").unwrap(),
            context,
            RunnerOptions {
                quiet: true,
                ..RunnerOptions::default()
            },
        );
        runner
            .run(RunOptions::new().retry(fast_retry(1)))
            .await
            .unwrap();
        assert!(sink.records().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn retry_logs_wait_message() {
        let (context, sink) = logged_context();
        let mut runner = Runner::shell(context, "sh -c 'exit 1'").unwrap();
        runner
            .run(RunOptions::new().retry(fast_retry(2)))
            .await
            .unwrap();

        let debug = sink.messages_at(LogLevel::Debug);
        let retries: Vec<_> = debug.iter().filter(|m| m.starts_with("Retrying")).collect();
        assert_eq!(retries.len(), 2);
        assert!(retries[0].starts_with("Retrying 'sh -c 'exit 1'' in "));
        assert!(retries[1].ends_with("(attempt=2/2)"));
        assert_eq!(sink.messages_at(LogLevel::Warning).len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_reflects_last_attempt() {
        let dir = TempDir::new().unwrap();
        let (script, _counter) = counting_script(&dir, "echo \"attempt $n\"\nexit 1");
        let mut runner =
            Runner::argv(context(), ["sh".to_string(), script.display().to_string()]).unwrap();

        runner
            .run(RunOptions::new().retry(fast_retry(2)))
            .await
            .unwrap();
        assert_eq!(runner.stdout().unwrap().trim(), "attempt 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn no_retry_code_on_later_attempt_stops_loop() {
        let dir = TempDir::new().unwrap();
        let (script, counter) =
            counting_script(&dir, "if [ $n -ge 2 ]; then exit 5; fi\nexit 1");
        let mut runner =
            Runner::argv(context(), ["sh".to_string(), script.display().to_string()]).unwrap();

        let code = runner
            .run(
                RunOptions::new()
                    .retry(fast_retry(5).with_no_retry_returncodes(vec![5]))
                    .check(true),
            )
            .await
            .unwrap();
        assert_eq!(code, 5);
        assert_eq!(invocations(&counter), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_attempt() {
        let mut runner = Runner::argv(context(), ["sleep", "5"]).unwrap();
        let started = std::time::Instant::now();

        let err = runner
            .run(RunOptions::new().timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        match err {
            RunnerError::Timeout { command, timeout } => {
                assert_eq!(command, "sleep 5");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(runner.returncode().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_propagates_mid_retry() {
        let dir = TempDir::new().unwrap();
        let (script, counter) =
            counting_script(&dir, "if [ $n -ge 2 ]; then sleep 5; fi\nexit 1");
        let mut runner =
            Runner::argv(context(), ["sh".to_string(), script.display().to_string()]).unwrap();

        let err = runner
            .run(
                RunOptions::new()
                    .retry(fast_retry(3))
                    .timeout(Duration::from_millis(300)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
        assert_eq!(invocations(&counter), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_survives_background_holder_of_pipes() {
        let mut runner = Runner::shell(context(), "echo test; sleep 8 &").unwrap();
        let started = std::time::Instant::now();

        let code = runner.run(RunOptions::new()).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(runner.stdout().unwrap().trim(), "test");
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn partial_stderr_still_matches_ignore_pattern() {
        let mut runner = Runner::with_options(
            Command::shell("echo 'benign warning' 1>&2; sleep 8 & exit 1").unwrap(),
            context(),
            RunnerOptions {
                ignore_stderr: Some(Regex::new("benign").unwrap()),
                ..RunnerOptions::default()
            },
        );

        let code = runner.run(RunOptions::new().check(true)).await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(runner.stderr().unwrap().trim(), "benign warning");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_exit_is_negative() {
        let mut runner = Runner::argv(context(), ["sh", "-c", "kill -9 $$"]).unwrap();
        let code = runner.run(RunOptions::new()).await.unwrap();
        assert_eq!(code, -9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn popen_returns_live_child() {
        let context = context();
        context.set_save_history(true);
        let mut runner = Runner::shell(Arc::clone(&context), "grep a").unwrap();

        let spawned = runner
            .popen(PopenOptions {
                pipe_stdin: true,
                env: None,
            })
            .unwrap();
        assert!(matches!(spawned, Spawned::Child(_)));

        let output = spawned.communicate(Some(b"aaa")).await.unwrap();
        assert_eq!(output.returncode, 0);
        assert_eq!(output.stdout.trim(), "aaa");
        assert!(output.stderr.is_empty());
        assert_eq!(context.history(), vec!["grep a"]);
        // popen leaves captured state to the caller.
        assert!(runner.returncode().is_none());
    }

    #[tokio::test]
    async fn popen_dry_run_returns_placeholder() {
        let mut runner = Runner::with_options(
            Command::shell("__not_exist_command__").unwrap(),
            context(),
            RunnerOptions {
                dry_run: Some(true),
                ..RunnerOptions::default()
            },
        );

        let mut spawned = runner.popen(PopenOptions::default()).unwrap();
        assert!(spawned.child_mut().is_none());
        let output = spawned.communicate(None).await.unwrap();
        assert_eq!(output, CompletedOutput::dry_run());
        assert_eq!(runner.returncode(), Some(0));
    }

    #[tokio::test]
    async fn popen_verifies_command() {
        let mut runner = Runner::argv(context(), ["__not_exist_command__"]).unwrap();
        let err = runner.popen(PopenOptions::default()).unwrap_err();
        assert!(matches!(err, RunnerError::Command(CommandError::NotFound { .. })));
    }
}
