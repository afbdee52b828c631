//! Errors raised before a child process is ever spawned.

use thiserror::Error;

/// A command could not be started.
///
/// Distinguishes "could not start" from "ran and failed"; the latter is a
/// runner concern and carries captured output instead of an errno.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Empty or malformed command.
    #[error("invalid command: '{command}'")]
    Invalid { command: String },
    /// The executable could not be located on the search path.
    #[error("command not found: '{command}'")]
    NotFound { command: String },
}

impl CommandError {
    pub fn invalid(command: impl Into<String>) -> Self {
        Self::Invalid {
            command: command.into(),
        }
    }

    pub fn not_found(command: impl Into<String>) -> Self {
        Self::NotFound {
            command: command.into(),
        }
    }

    /// The offending command string.
    pub fn command(&self) -> &str {
        match self {
            Self::Invalid { command } | Self::NotFound { command } => command,
        }
    }

    /// POSIX errno equivalent: `EINVAL` for invalid commands, `ENOENT` for
    /// commands that could not be found.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Invalid { .. } => libc::EINVAL,
            Self::NotFound { .. } => libc::ENOENT,
        }
    }
}
