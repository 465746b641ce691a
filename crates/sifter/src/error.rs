//! Error types for the sifter library.
//!
//! Errors fall into two groups:
//! - Per-record errors (network trouble, provider refusals, invalid bibliographic data). These are
//!   contained at the record level by the [`crate::scheduler::StageScheduler`] and only show up
//!   in the run summary.
//! - Run-level errors ([`SifterError::Persistence`], [`SifterError::FatalThreshold`],
//!   configuration problems). These propagate to the caller and halt the run.
//!
//! Outbound calls report failures through the smaller [`CallError`] so that the retry
//! machinery in [`crate::client`] can decide what to do without inspecting strings.
//!
//! # Examples
//!
//! ```
//! use sifter::error::{CallError, SifterError};
//!
//! let err: SifterError = CallError::Permanent("403 Forbidden".into()).into();
//! assert!(matches!(err, SifterError::PermanentProvider(_)));
//! assert!(!err.is_run_fatal());
//! ```

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Error type alias used for the [`sifter`](crate) crate.
pub type Result<T, E = SifterError> = core::result::Result<T, E>;

/// Errors that can occur while running the pipeline.
#[derive(Error, Debug)]
pub enum SifterError {
  /// A network call failed in a way that may succeed on retry.
  ///
  /// Covers connection resets, timeouts and 5xx-equivalent responses.
  #[error("Transient network error: {0}")]
  TransientNetwork(String),

  /// The remote side signalled rate limiting.
  ///
  /// `retry_after` carries the provider-suggested delay when one was given.
  #[error("Rate limited{}", .retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
  RateLimited {
    /// Provider-suggested delay before the next attempt.
    retry_after: Option<Duration>,
  },

  /// The remote side refused the request and retrying will not help.
  #[error("Permanent provider error: {0}")]
  PermanentProvider(String),

  /// A bibliographic record failed validation and cannot be processed.
  #[error("Invalid record data: {0}")]
  DataValidation(String),

  /// Writing a checkpoint failed even after retrying.
  ///
  /// The last checkpoint that was successfully written is left untouched on disk.
  #[error("Failed to persist checkpoint to {path:?} after {attempts} attempts: {source}")]
  Persistence {
    /// Checkpoint file being written.
    path:     PathBuf,
    /// Number of write attempts made.
    attempts: u32,
    /// The last I/O failure.
    #[source]
    source:   std::io::Error,
  },

  /// Too many records failed and the run was halted.
  #[error("{failed}/{total} records failed, exceeding the fatal threshold of {threshold}")]
  FatalThreshold {
    /// Number of records that failed.
    failed:    usize,
    /// Number of records in the run.
    total:     usize,
    /// Configured failure fraction.
    threshold: f64,
  },

  /// A checkpoint was readable but cannot be resumed safely.
  #[error("Refusing to resume from {path:?}: {reason}")]
  AmbiguousCheckpoint {
    /// Checkpoint file that was rejected.
    path:   PathBuf,
    /// Why it was rejected.
    reason: String,
  },

  /// A checkpoint file exists but does not parse.
  #[error("Checkpoint {path:?} is unreadable: {source}")]
  CorruptCheckpoint {
    /// Checkpoint file that failed to parse.
    path:   PathBuf,
    /// Parse failure.
    #[source]
    source: serde_json::Error,
  },

  /// A record status update would have moved a record backwards.
  #[error("Record {id} cannot move from {from} to {to}")]
  StatusRegression {
    /// Record identifier.
    id:   String,
    /// Current status.
    from: String,
    /// Requested status.
    to:   String,
  },

  /// Configuration is missing or invalid.
  #[error("Configuration error: {0}")]
  Config(String),

  /// Something was requested that does not exist.
  #[error("Not found: {0}")]
  NotFound(String),

  /// A file system operation failed.
  #[error(transparent)]
  Io(#[from] std::io::Error),

  /// JSON (de)serialization failed.
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// The configuration file could not be parsed.
  #[error(transparent)]
  TomlDe(#[from] toml::de::Error),

  /// An HTTP request could not be built or sent.
  #[error(transparent)]
  Network(#[from] reqwest::Error),

  /// A SQLite operation failed.
  #[error(transparent)]
  Sqlite(#[from] rusqlite::Error),

  /// An async SQLite operation failed.
  #[error(transparent)]
  AsyncSqlite(#[from] tokio_rusqlite::Error),

  /// PDF parsing failed.
  #[error(transparent)]
  Lopdf(#[from] lopdf::Error),

  /// A regular expression in the configuration did not compile.
  #[error(transparent)]
  Regex(#[from] regex::Error),

  /// A URL in the configuration or a provider response did not parse.
  #[error(transparent)]
  Url(#[from] url::ParseError),
}

impl SifterError {
  /// Whether this error must halt the whole run rather than a single record.
  pub fn is_run_fatal(&self) -> bool {
    matches!(
      self,
      Self::Persistence { .. }
        | Self::FatalThreshold { .. }
        | Self::Config(_)
        | Self::AmbiguousCheckpoint { .. }
    )
  }
}

/// Classified failure of one outbound call attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
  /// Explicit rate-limit signal, with the provider's suggested delay if any.
  #[error("rate limited")]
  RateLimited {
    /// Provider-suggested delay.
    retry_after: Option<Duration>,
  },
  /// Retryable failure (network, 5xx).
  #[error("transient: {0}")]
  Transient(String),
  /// Non-retryable failure (4xx other than rate limiting, malformed payloads).
  #[error("permanent: {0}")]
  Permanent(String),
}

impl CallError {
  /// Whether another attempt may succeed.
  pub fn is_retryable(&self) -> bool { !matches!(self, Self::Permanent(_)) }

  /// Classifies an HTTP status code. Returns `None` for success codes.
  pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> Option<Self> {
    if status.is_success() {
      None
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
      Some(Self::RateLimited { retry_after })
    } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
      Some(Self::Transient(format!("HTTP {status}")))
    } else {
      Some(Self::Permanent(format!("HTTP {status}")))
    }
  }
}

impl From<reqwest::Error> for CallError {
  fn from(err: reqwest::Error) -> Self {
    if let Some(status) = err.status() {
      if let Some(call_err) = Self::from_status(status, None) {
        return call_err;
      }
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
      Self::Transient(err.to_string())
    } else {
      Self::Permanent(err.to_string())
    }
  }
}

impl From<CallError> for SifterError {
  fn from(err: CallError) -> Self {
    match err {
      CallError::RateLimited { retry_after } => Self::RateLimited { retry_after },
      CallError::Transient(msg) => Self::TransientNetwork(msg),
      CallError::Permanent(msg) => Self::PermanentProvider(msg),
    }
  }
}
