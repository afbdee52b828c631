//! Output rendering for the subproc CLI.

use serde::Serialize;
use subproc::{Context, Runner, Which};

/// JSON shape printed by `run --json`.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub command: String,
    pub returncode: Option<i32>,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub dry_run: bool,
    pub history: Vec<String>,
}

impl<'a> RunReport<'a> {
    pub fn new(runner: &'a Runner, context: &Context) -> Self {
        Self {
            command: runner.command_str(),
            returncode: runner.returncode(),
            stdout: runner.stdout().unwrap_or_default(),
            stderr: runner.stderr().unwrap_or_default(),
            dry_run: runner.dry_run(),
            history: context.history(),
        }
    }
}

/// Echo captured output, or print the JSON report.
pub fn print_run(runner: &Runner, context: &Context, json: bool) -> serde_json::Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&RunReport::new(runner, context))?
        );
        return Ok(());
    }

    if let Some(stdout) = runner.stdout() {
        print!("{stdout}");
    }
    if let Some(stderr) = runner.stderr() {
        eprint!("{stderr}");
    }
    Ok(())
}

/// Print the resolved path and return the process exit code.
pub fn print_which(which: &Which) -> i32 {
    match which.locate().filter(|path| path.exists()) {
        Some(path) => {
            println!("{}", path.display());
            0
        }
        None => {
            eprintln!("{which}");
            1
        }
    }
}
