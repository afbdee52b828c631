//! Exponential backoff with jitter between retry attempts.
//!
//! `delay = backoff_factor * 2^(attempt - 1) + U[0.5 * jitter, 1.5 * jitter)`.
//! Growth is unbounded unless a ceiling is set with
//! [`RetryPolicy::with_max_delay`]; with a large `total` the later waits get
//! very long.

use crate::logging::LogSink;
use rand::Rng;
use std::time::Duration;
use subproc_core::Config;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    #[error("{name} must be greater than zero, got {value}")]
    InvalidArgument { name: &'static str, value: f64 },
}

/// How many extra attempts to make and how long to wait between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    total: u32,
    backoff_factor: f64,
    jitter: f64,
    no_retry_returncodes: Vec<i32>,
    max_delay: Option<Duration>,
    quiet: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total: 3,
            backoff_factor: 0.2,
            jitter: 0.2,
            no_retry_returncodes: Vec::new(),
            max_delay: None,
            quiet: false,
        }
    }
}

impl RetryPolicy {
    /// `total` counts attempts made after the first one.
    pub fn new(total: u32, backoff_factor: f64, jitter: f64) -> Result<Self, RetryError> {
        if total == 0 {
            return Err(RetryError::InvalidArgument {
                name: "total",
                value: 0.0,
            });
        }
        Self::check_positive("backoff_factor", backoff_factor)?;
        Self::check_positive("jitter", jitter)?;

        Ok(Self {
            total,
            backoff_factor,
            jitter,
            ..Self::default()
        })
    }

    /// Build from the retry keys of a loaded config.
    pub fn from_config(config: &Config) -> Result<Self, RetryError> {
        let mut policy = Self::new(
            config.retry_total,
            config.retry_backoff_factor,
            config.retry_jitter,
        )?
        .with_no_retry_returncodes(config.no_retry_returncodes.clone());

        if let Some(secs) = config.retry_max_delay_sec {
            Self::check_positive("retry_max_delay_sec", secs)?;
            policy = policy.with_max_delay(Duration::from_secs_f64(secs));
        }
        Ok(policy)
    }

    /// Exit codes that end the retry loop immediately.
    pub fn with_no_retry_returncodes(mut self, codes: Vec<i32>) -> Self {
        self.no_retry_returncodes = codes;
        self
    }

    /// Ceiling applied to every computed delay, jitter included.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Suppress the "Retrying ..." message.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    pub fn no_retry_returncodes(&self) -> &[i32] {
        &self.no_retry_returncodes
    }

    pub fn is_no_retry(&self, code: i32) -> bool {
        self.no_retry_returncodes.contains(&code)
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.backoff_factor * 2f64.powi(exponent);
        let jitter = rand::rng().random_range(0.5 * self.jitter..1.5 * self.jitter);

        let delay = Duration::try_from_secs_f64(base + jitter).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Compute the delay, log it unless quiet, sleep, and return what was waited.
    pub async fn wait_before_retry(
        &self,
        attempt: u32,
        sink: Option<&dyn LogSink>,
        target: Option<&str>,
    ) -> Duration {
        let delay = self.compute_delay(attempt);

        if let Some(sink) = sink.filter(|_| !self.quiet) {
            sink.debug(&self.retry_message(attempt, delay, target));
        }

        tokio::time::sleep(delay).await;
        delay
    }

    fn retry_message(&self, attempt: u32, delay: Duration, target: Option<&str>) -> String {
        let prefix = match target {
            Some(target) if !target.is_empty() => format!("Retrying '{target}' in "),
            _ => "Retrying in ".to_string(),
        };
        format!(
            "{prefix}{:.2} seconds ... (attempt={attempt}/{})",
            delay.as_secs_f64(),
            self.total
        )
    }

    fn check_positive(name: &'static str, value: f64) -> Result<(), RetryError> {
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(RetryError::InvalidArgument { name, value })
        }
    }
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Retry(total={}, backoff-factor={}, jitter={}",
            self.total, self.backoff_factor, self.jitter
        )?;
        if !self.no_retry_returncodes.is_empty() {
            write!(f, ", no-retry-returncodes={:?}", self.no_retry_returncodes)?;
        }
        if let Some(max) = self.max_delay {
            write!(f, ", max-delay={}", max.as_secs_f64())?;
        }
        f.write_str(")")
    }
}
