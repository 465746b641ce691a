//! Throttled, retrying wrapper for outbound calls.
//!
//! [`RateLimitedClient`] does not know anything about HTTP payloads. Callers hand it a closure
//! that performs one attempt and classifies its failure as a [`CallError`]; the client decides
//! when that closure may run and whether it runs again.
//!
//! Per target (e.g. `llm`, `unpaywall`) the client enforces:
//! - at most `concurrency` attempts in flight at once,
//! - at least `min_interval` between the starts of consecutive attempts.
//!
//! Backoff sleeps happen outside the concurrency permit, so a worker waiting out a rate limit
//! does not hold up other workers talking to the same target.
//!
//! # Examples
//!
//! ```no_run
//! use sifter::{
//!   client::{Operation, RateLimitedClient},
//!   config::RateLimitConfig,
//!   error::CallError,
//! };
//!
//! # async fn example() -> Result<(), CallError> {
//! let client = RateLimitedClient::new(&RateLimitConfig::default());
//! let http = client.http().clone();
//! let body = client
//!   .call(Operation::new("crossref", "works"), || {
//!     let http = http.clone();
//!     async move {
//!       let response = http.get("https://api.crossref.org/works/10.1000/xyz").send().await?;
//!       if let Some(err) = CallError::from_status(response.status(), None) {
//!         return Err(err);
//!       }
//!       Ok(response.text().await?)
//!     }
//!   })
//!   .await?;
//! # Ok(())
//! # }
//! ```

use std::{
  future::Future,
  sync::{
    atomic::{AtomicU64, Ordering as AtomicOrdering},
    Arc,
  },
  time::Duration,
};

use tokio::{
  sync::{Mutex, Semaphore},
  time::Instant,
};

use super::*;
use crate::{
  audit::{AuditEntry, AuditLog},
  backoff::BackoffPolicy,
  config::RateLimitConfig,
};

/// Identifies one downstream API operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation {
  /// Downstream service. Throttling is keyed on this.
  pub target: String,
  /// What is being done, for logs and audit rows.
  pub name:   String,
}

impl Operation {
  /// Creates an operation.
  pub fn new(target: impl Into<String>, name: impl Into<String>) -> Self {
    Self { target: target.into(), name: name.into() }
  }
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.target, self.name)
  }
}

/// Reads a `Retry-After` header given in seconds.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
  headers
    .get(reqwest::header::RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}

/// Throttling state of one target.
#[derive(Debug)]
struct Throttle {
  permits:    Semaphore,
  next_start: Mutex<Instant>,
}

/// Rate limited, retrying client shared by the language model and every provider.
pub struct RateLimitedClient {
  http:           reqwest::Client,
  backoff:        BackoffPolicy,
  max_retries:    u32,
  concurrency:    usize,
  min_interval:   Duration,
  throttles:      Mutex<HashMap<String, Arc<Throttle>>>,
  audit:          Option<AuditLog>,
  audit_failures: AtomicU64,
}

impl RateLimitedClient {
  /// Creates a client from rate-limit settings.
  pub fn new(config: &RateLimitConfig) -> Self {
    Self {
      http:           reqwest::Client::builder()
        .user_agent(concat!("sifter/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default(),
      backoff:        config.backoff(),
      max_retries:    config.max_retries,
      concurrency:    config.concurrency.max(1),
      min_interval:   config.min_interval(),
      throttles:      Mutex::new(HashMap::new()),
      audit:          None,
      audit_failures: AtomicU64::new(0),
    }
  }

  /// Records every attempt in `audit`.
  pub fn with_audit(mut self, audit: AuditLog) -> Self {
    self.audit = Some(audit);
    self
  }

  /// Replaces the backoff policy.
  pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
    self.backoff = backoff;
    self
  }

  /// Underlying HTTP client, for building requests inside call closures.
  pub fn http(&self) -> &reqwest::Client { &self.http }

  /// Backoff policy shared with callers that schedule their own retries.
  pub fn backoff(&self) -> &BackoffPolicy { &self.backoff }

  /// Retries allowed after the first attempt in [`call`](Self::call).
  pub fn max_retries(&self) -> u32 { self.max_retries }

  /// Performs `attempt` with retries.
  ///
  /// Rate-limited and transient failures are retried up to `max_retries` times, waiting
  /// `max(suggested, base * multiplier^retry)` plus jitter in between. Permanent failures
  /// return immediately.
  pub async fn call<T, F, Fut>(&self, operation: Operation, mut attempt: F) -> Result<T, CallError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>, {
    let mut retry = 0;
    loop {
      match self.call_once(&operation, retry + 1, &mut attempt).await {
        Ok(value) => return Ok(value),
        Err(err) if !err.is_retryable() || retry >= self.max_retries => return Err(err),
        Err(err) => {
          let suggested = match &err {
            CallError::RateLimited { retry_after } => *retry_after,
            _ => None,
          };
          let delay = self.backoff.delay_for(retry, suggested);
          debug!("{operation} attempt {} failed ({err}); retrying in {delay:?}", retry + 1);
          tokio::time::sleep(delay).await;
          retry += 1;
        },
      }
    }
  }

  /// Performs exactly one throttled attempt and logs it.
  ///
  /// `number` is the 1-based attempt number recorded in the audit log.
  pub async fn call_once<T, F, Fut>(
    &self,
    operation: &Operation,
    number: u32,
    attempt: F,
  ) -> Result<T, CallError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CallError>>, {
    let throttle = self.throttle(&operation.target).await;
    let _permit = throttle
      .permits
      .acquire()
      .await
      .map_err(|_| CallError::Permanent(format!("throttle for {} closed", operation.target)))?;

    let start = {
      let mut next = throttle.next_start.lock().await;
      let start = (*next).max(Instant::now());
      *next = start + self.min_interval;
      start
    };
    tokio::time::sleep_until(start).await;

    let started = Instant::now();
    let result = attempt().await;
    let elapsed = started.elapsed();
    drop(_permit);

    let (outcome, detail) = match &result {
      Ok(_) => ("success", None),
      Err(CallError::RateLimited { retry_after }) =>
        ("rate_limited", retry_after.map(|d| format!("retry after {}ms", d.as_millis()))),
      Err(CallError::Transient(msg)) => ("transient", Some(msg.clone())),
      Err(CallError::Permanent(msg)) => ("permanent", Some(msg.clone())),
    };
    trace!("{operation} attempt {number}: {outcome} in {elapsed:?}");
    self
      .audit(AuditEntry {
        at: Utc::now(),
        target: operation.target.clone(),
        operation: operation.name.clone(),
        attempt: number,
        outcome: outcome.to_string(),
        detail,
        duration_ms: elapsed.as_millis() as u64,
      })
      .await;

    result
  }

  async fn throttle(&self, target: &str) -> Arc<Throttle> {
    let mut throttles = self.throttles.lock().await;
    throttles
      .entry(target.to_string())
      .or_insert_with(|| {
        Arc::new(Throttle {
          permits:    Semaphore::new(self.concurrency),
          next_start: Mutex::new(Instant::now()),
        })
      })
      .clone()
  }

  /// Audit entries that could not be written since the client was created.
  pub fn audit_failures(&self) -> u64 { self.audit_failures.load(AtomicOrdering::Relaxed) }

  // A lost audit row never fails the call it describes.
  async fn audit(&self, entry: AuditEntry) {
    if let Some(audit) = &self.audit {
      if let Err(e) = audit.append(entry).await {
        self.audit_failures.fetch_add(1, AtomicOrdering::Relaxed);
        warn!("Failed to write audit entry: {e}");
      }
    }
  }
}
