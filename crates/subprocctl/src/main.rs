//! subproc - run external commands with retries from the shell.
//!
//! Thin front end over the `subproc` library: loads `.subproc/config`,
//! builds a runner from the command line, and exits with the command's code.

mod render;

use clap::{Args, Parser, Subcommand};
use eyre::{ensure, WrapErr};
use mimalloc::MiMalloc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use subproc::{
    Command, Context, RetryPolicy, RunOptions, Runner, RunnerOptions, TracingSink, Which,
};
use subproc_core::Config;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Run external commands with optional retries and dry-run.
#[derive(Parser)]
#[command(name = "subproc", version)]
struct Cli {
    /// Config file path (overrides .subproc/config)
    #[arg(long, global = true, env = "SUBPROC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable runner logging at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run a command, optionally retrying on failure
    Run(RunArgs),

    /// Locate an executable on the search path
    Which {
        /// Executable name
        name: String,

        /// Print the real path behind a symlink
        #[arg(long)]
        follow_symlinks: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Log the command instead of executing it
    #[arg(long)]
    dry_run: bool,

    /// Exit with an error when the command finally fails
    #[arg(long)]
    check: bool,

    /// Join the arguments into one line and run it through the shell
    #[arg(long)]
    shell: bool,

    /// Retry up to N more times after a failure
    #[arg(long, value_name = "N")]
    retry: Option<u32>,

    /// Base of the exponential backoff, in seconds
    #[arg(long, value_name = "F")]
    backoff_factor: Option<f64>,

    /// Jitter magnitude, in seconds
    #[arg(long, value_name = "F")]
    jitter: Option<f64>,

    /// Ceiling on any single retry wait, in seconds
    #[arg(long, value_name = "SEC")]
    max_delay: Option<f64>,

    /// Exit code that stops retrying (repeatable)
    #[arg(long = "no-retry-code", value_name = "N", allow_negative_numbers = true)]
    no_retry_codes: Vec<i32>,

    /// Per-attempt timeout, in seconds
    #[arg(long, value_name = "SEC")]
    timeout: Option<f64>,

    /// Treat failures whose stderr matches as expected
    #[arg(long, value_name = "REGEX", value_parser = parse_regex)]
    ignore_stderr: Option<Regex>,

    /// Text written to the command's stdin
    #[arg(long)]
    input: Option<String>,

    /// Encoding for --input (ascii, utf-8, latin-1)
    #[arg(long)]
    encoding: Option<String>,

    /// Suppress runner debug and failure messages
    #[arg(long)]
    quiet: bool,

    /// Print a JSON report instead of the raw output
    #[arg(long)]
    json: bool,

    /// Command and arguments
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

fn parse_regex(s: &str) -> Result<Regex, String> {
    Regex::new(s).map_err(|e| format!("invalid pattern '{s}': {e}"))
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    let code = match cli.command {
        CliCommand::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .wrap_err("failed to create tokio runtime")?;
            runtime.block_on(run_command(&config, args, cli.verbose))?
        }
        CliCommand::Which {
            name,
            follow_symlinks,
        } => which_command(&name, follow_symlinks)?,
    };

    if code != 0 {
        std::process::exit(shell_exit_code(code));
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            Config::from_file(path)
                .wrap_err_with(|| format!("failed to load config {}", path.display()))
        }
        None => {
            let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
            debug!(root = %cwd.display(), "discovering config");
            Config::discover(&cwd).wrap_err("failed to load .subproc/config")
        }
    }
}

async fn run_command(config: &Config, args: RunArgs, verbose: bool) -> eyre::Result<i32> {
    let context = Context::from_config(config, Arc::new(TracingSink));
    if verbose {
        context.set_logging(true);
    }
    let context = context.into_shared();

    let command = if args.shell {
        Command::shell(args.command.join(" "))?
    } else {
        Command::argv(args.command.iter().cloned())?
    };

    let mut runner = Runner::with_options(
        command,
        Arc::clone(&context),
        RunnerOptions {
            dry_run: args.dry_run.then_some(true),
            ignore_stderr: args.ignore_stderr.clone(),
            quiet: args.quiet,
            error_log_level: None,
        },
    );

    let options = run_options(config, &args)?;
    let outcome = runner.run(options).await;

    if runner.returncode().is_some() {
        render::print_run(&runner, &context, args.json)?;
    }
    Ok(outcome?)
}

fn run_options(config: &Config, args: &RunArgs) -> eyre::Result<RunOptions> {
    let mut options = RunOptions::from_config(config).check(args.check);
    if let Some(secs) = args.timeout {
        options = options.timeout(seconds("--timeout", secs)?);
    }
    if let Some(input) = &args.input {
        options = options.input(input.as_str());
    }
    if let Some(encoding) = &args.encoding {
        options = options.encoding(encoding.as_str());
    }
    if let Some(policy) = retry_policy(config, args)? {
        options = options.retry(policy);
    }
    Ok(options)
}

/// Retries are enabled by `--retry`; the remaining knobs fall back to config.
fn retry_policy(config: &Config, args: &RunArgs) -> eyre::Result<Option<RetryPolicy>> {
    let Some(total) = args.retry else {
        return Ok(None);
    };

    let codes = if args.no_retry_codes.is_empty() {
        config.no_retry_returncodes.clone()
    } else {
        args.no_retry_codes.clone()
    };

    let mut policy = RetryPolicy::new(
        total,
        args.backoff_factor.unwrap_or(config.retry_backoff_factor),
        args.jitter.unwrap_or(config.retry_jitter),
    )?
    .with_no_retry_returncodes(codes);

    if let Some(secs) = args.max_delay.or(config.retry_max_delay_sec) {
        policy = policy.with_max_delay(seconds("--max-delay", secs)?);
    }
    Ok(Some(policy))
}

fn which_command(name: &str, follow_symlinks: bool) -> eyre::Result<i32> {
    let which = Which::new(name)?.follow_symlinks(follow_symlinks);
    Ok(render::print_which(&which))
}

fn seconds(flag: &str, secs: f64) -> eyre::Result<Duration> {
    ensure!(secs > 0.0, "{flag} must be greater than zero, got {secs}");
    Duration::try_from_secs_f64(secs).wrap_err_with(|| format!("{flag} is out of range: {secs}"))
}

/// Signal deaths are reported as `128 + signal`, like a POSIX shell.
fn shell_exit_code(code: i32) -> i32 {
    if code < 0 {
        128 - code
    } else {
        code
    }
}
