//! Error taxonomy and bounded retry logic.
//!
//! The publish pipeline distinguishes four failure kinds: a file that cannot
//! be read right now ([`ReadError`]), a table that breaks the column contract
//! (reported as [`crate::table::SchemaViolation`]s), a subscriber or client
//! that fails to accept a delivery ([`SubscriberError`], [`DeliveryError`]),
//! and a resuming client asking for history that is no longer retained
//! ([`ResyncRequired`]). None of them is fatal to the pipeline.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;

/// The watched file could not be turned into a table on this cycle.
///
/// Read errors are transient. The cycle aborts, the last good snapshot stays
/// current, and nothing is retried until the next change notification.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is empty (truncated while being rewritten?)")]
    Empty { path: PathBuf },

    #[error("{path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} changed while it was being read")]
    ChangedDuringRead { path: PathBuf },
}

/// Snapshot commit rejected because the sequence number was not the next one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("sequence conflict: expected {expected}, found {found}")]
    SequenceConflict { expected: u64, found: u64 },
}

/// An in-process subscriber failed while handling a committed change set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("subscriber {handle} returned an error: {message}")]
    Failed { handle: u64, message: String },

    #[error("subscriber {handle} panicked: {message}")]
    Panicked { handle: u64, message: String },
}

impl SubscriberError {
    pub fn handle(&self) -> u64 {
        match self {
            SubscriberError::Failed { handle, .. } | SubscriberError::Panicked { handle, .. } => {
                *handle
            }
        }
    }
}

/// A delivery target could not accept a feed event.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0}")]
    Rejected(String),

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A resuming client asked for a sequence outside the retained history.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
#[error("resync required: sequence {requested} is not retained (oldest {oldest_retained:?}, current {current:?})")]
pub struct ResyncRequired {
    pub requested: u64,
    pub oldest_retained: Option<u64>,
    pub current: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation under `policy`, returning the last error once
/// the attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= policy.max_attempts.max(1) {
                    return Err(e);
                }

                let delay = policy.delay_after(attempts);
                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "{what} failed: {e}; retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
