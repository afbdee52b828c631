//! Executable resolution on the search path.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use subproc_core::CommandError;

/// Locates a single executable by name.
///
/// The first successful lookup is cached for the lifetime of the value;
/// [`Which::exists`] re-checks the cached path against the filesystem so a
/// deleted binary is not reported as present.
#[derive(Debug)]
pub struct Which {
    command: String,
    follow_symlinks: bool,
    resolved: OnceLock<PathBuf>,
}

impl Which {
    /// Fails with `CommandError::Invalid` when `command` is empty.
    pub fn new(command: impl Into<String>) -> Result<Self, CommandError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(CommandError::invalid(command));
        }
        Ok(Self {
            command,
            follow_symlinks: false,
            resolved: OnceLock::new(),
        })
    }

    /// Resolve symbolic links to their real path before caching.
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Absolute path of the executable, or `None` if it isn't reachable.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = self.resolved.get() {
            return Some(path.clone());
        }

        let found = which::which(&self.command).ok()?;
        let found = if self.follow_symlinks {
            Self::real_path(found)
        } else {
            found
        };

        Some(self.resolved.get_or_init(|| found).clone())
    }

    /// True iff the executable resolves and the path still exists on disk.
    pub fn exists(&self) -> bool {
        self.locate().is_some_and(|path| path.exists())
    }

    pub fn verify(&self) -> Result<(), CommandError> {
        if self.exists() {
            Ok(())
        } else {
            Err(CommandError::not_found(&self.command))
        }
    }

    fn real_path(path: PathBuf) -> PathBuf {
        let is_symlink = Path::new(&path)
            .symlink_metadata()
            .is_ok_and(|meta| meta.file_type().is_symlink());
        if !is_symlink {
            return path;
        }
        match std::fs::canonicalize(&path) {
            Ok(real) => real,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "failed to resolve symlink");
                path
            }
        }
    }
}

impl std::fmt::Display for Which {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.locate().filter(|path| path.exists());
        write!(
            f,
            "command={}, exists={}, follow_symlinks={}",
            self.command,
            path.is_some(),
            self.follow_symlinks
        )?;
        if let Some(path) = path {
            write!(f, ", abspath={}", path.display())?;
        }
        Ok(())
    }
}
