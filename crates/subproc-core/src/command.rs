//! Command representation.
//!
//! A command is either a shell string (interpreted by `sh -c` / `cmd /C`) or
//! an argv sequence executed directly. The two never mix: every consumer
//! matches on the variant rather than inspecting the value.

use crate::error::CommandError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// A single string handed to the platform shell.
    Shell(String),
    /// Argument tokens; the first token is the executable.
    Argv(Vec<String>),
}

impl Command {
    /// Build a shell-mode command.
    pub fn shell(command: impl Into<String>) -> Result<Self, CommandError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(CommandError::invalid(command));
        }
        Ok(Self::Shell(command))
    }

    /// Build an argv-mode command.
    pub fn argv<I, S>(args: I) -> Result<Self, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        match args.first() {
            Some(program) if !program.is_empty() => Ok(Self::Argv(args)),
            _ => Err(CommandError::invalid(args.join(" "))),
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, Self::Shell(_))
    }

    /// The executable name that has to be resolvable before running.
    ///
    /// For shell strings this is the first whitespace-separated token with
    /// any leading subshell parentheses removed, so `(cd /tmp && ls)` yields
    /// `cd`. May be empty for degenerate input like `( ls`.
    pub fn program(&self) -> &str {
        match self {
            Self::Shell(line) => line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .trim_start_matches('('),
            Self::Argv(args) => args.first().map(String::as_str).unwrap_or_default(),
        }
    }

    /// Single-line representation used in logs, errors, and history.
    pub fn to_command_string(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Argv(args) => args.join(" "),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::shell(value)
    }
}

impl TryFrom<String> for Command {
    type Error = CommandError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::shell(value)
    }
}

impl TryFrom<Vec<String>> for Command {
    type Error = CommandError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::argv(value)
    }
}

impl TryFrom<&[&str]> for Command {
    type Error = CommandError;

    fn try_from(value: &[&str]) -> Result<Self, Self::Error> {
        Self::argv(value.iter().copied())
    }
}
