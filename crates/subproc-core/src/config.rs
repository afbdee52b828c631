//! Configuration parsing.
//!
//! Plain `key=value` lines, `#` comments, optional quotes around values.
//! Precedence in the CLI: flags > `--config` file > `.subproc/config` > defaults.

use crate::history::DEFAULT_HISTORY_SIZE;
use crate::types::LogLevel;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Conventional config location relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".subproc/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid number value for {key}: {value}")]
    InvalidFloat { key: String, value: String },
    #[error("invalid log level for {key}: {value}")]
    InvalidLogLevel { key: String, value: String },
}

/// Runtime defaults and retry settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default dry-run value for runners that don't override it.
    pub dry_run: bool,

    // History
    pub save_history: bool,
    pub history_size: usize,

    // Logging
    pub logging: bool,
    pub error_log_level: LogLevel,

    // Retry
    pub retry_total: u32,
    pub retry_backoff_factor: f64,
    pub retry_jitter: f64,
    /// Ceiling on a single retry wait, in seconds (unset = unbounded).
    pub retry_max_delay_sec: Option<f64>,
    pub no_retry_returncodes: Vec<i32>,

    // Execution
    /// Per-attempt timeout in seconds (0 = no timeout).
    pub timeout_sec: u64,
    /// Encoding used for text written to stdin.
    pub encoding: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: false,
            save_history: false,
            history_size: DEFAULT_HISTORY_SIZE,
            logging: false,
            error_log_level: LogLevel::DEFAULT_ERROR,
            retry_total: 3,
            retry_backoff_factor: 0.2,
            retry_jitter: 0.2,
            retry_max_delay_sec: None,
            no_retry_returncodes: Vec::new(),
            timeout_sec: 0,
            encoding: "ascii".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `.subproc/config` under `root` if it exists, else defaults.
    pub fn discover(root: &Path) -> Result<Self, ConfigError> {
        let path = Self::default_path(root);
        if path.is_file() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_path(root: &Path) -> PathBuf {
        root.join(DEFAULT_CONFIG_PATH)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Per-attempt timeout, if configured.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_sec > 0).then(|| std::time::Duration::from_secs(self.timeout_sec))
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "dry_run" => self.dry_run = Self::parse_bool(key, value)?,
            "save_history" => self.save_history = Self::parse_bool(key, value)?,
            "history_size" => self.history_size = Self::parse_int(key, value)?,
            "logging" => self.logging = Self::parse_bool(key, value)?,
            "error_log_level" => {
                self.error_log_level =
                    LogLevel::parse(value).ok_or_else(|| ConfigError::InvalidLogLevel {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "retry_total" => self.retry_total = Self::parse_int(key, value)?,
            "retry_backoff_factor" => self.retry_backoff_factor = Self::parse_float(key, value)?,
            "retry_jitter" => self.retry_jitter = Self::parse_float(key, value)?,
            "retry_max_delay_sec" => {
                self.retry_max_delay_sec = if value.is_empty() {
                    None
                } else {
                    Some(Self::parse_float(key, value)?)
                };
            }
            "no_retry_returncodes" => {
                self.no_retry_returncodes = value
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(|s| Self::parse_int(key, s))
                    .collect::<Result<_, _>>()?;
            }
            "timeout_sec" => self.timeout_sec = Self::parse_int(key, value)?,
            "encoding" => self.encoding = value.to_string(),
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_float(key: &str, value: &str) -> Result<f64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidFloat {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}
