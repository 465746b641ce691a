//! Exponential backoff with jitter.
//!
//! One [`BackoffPolicy`] is shared by every component that retries: the language model client,
//! the acquisition chain and checkpoint persistence all compute their delays here.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use sifter::backoff::BackoffPolicy;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(100))
//!   .with_ceiling(Duration::from_secs(1))
//!   .with_jitter(0.0);
//!
//! assert_eq!(policy.delay(0), Duration::from_millis(100));
//! assert_eq!(policy.delay(2), Duration::from_millis(400));
//! assert_eq!(policy.delay(10), Duration::from_secs(1));
//! ```

use std::time::Duration;

use rand::Rng;

use super::*;

/// Delay schedule of `base * multiplier^retry`, capped at `ceiling`, plus up to `jitter` of
/// random extra delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
  /// Delay before the first retry.
  pub base:       Duration,
  /// Growth factor between consecutive retries.
  pub multiplier: f64,
  /// Upper bound on the computed delay, before jitter.
  pub ceiling:    Duration,
  /// Jitter ratio in `[0, 1]`. The final delay is drawn from `[d, d * (1 + jitter)]`.
  pub jitter:     f64,
}

impl Default for BackoffPolicy {
  fn default() -> Self { Self::new(Duration::from_millis(500)) }
}

impl BackoffPolicy {
  /// Creates a doubling policy with a 30 second ceiling and 20% jitter.
  pub fn new(base: Duration) -> Self {
    Self { base, multiplier: 2.0, ceiling: Duration::from_secs(30), jitter: 0.2 }
  }

  /// A policy that never waits. Useful in tests.
  pub fn immediate() -> Self {
    Self { base: Duration::ZERO, multiplier: 1.0, ceiling: Duration::ZERO, jitter: 0.0 }
  }

  /// Sets the growth factor.
  pub fn with_multiplier(mut self, multiplier: f64) -> Self {
    self.multiplier = multiplier.max(1.0);
    self
  }

  /// Sets the delay ceiling.
  pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
    self.ceiling = ceiling;
    self
  }

  /// Sets the jitter ratio, clamped to `[0, 1]`.
  pub fn with_jitter(mut self, jitter: f64) -> Self {
    self.jitter = jitter.clamp(0.0, 1.0);
    self
  }

  /// The deterministic part of the delay for the given retry number (0-based).
  pub fn computed(&self, retry: u32) -> Duration {
    let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
    let millis = self.base.as_millis() as f64 * factor;
    let ceiling = self.ceiling.as_millis() as f64;
    Duration::from_millis(millis.min(ceiling).max(0.0) as u64)
  }

  /// Delay before retry number `retry`, jitter included.
  pub fn delay(&self, retry: u32) -> Duration { self.apply_jitter(self.computed(retry)) }

  /// Delay honoring a provider-suggested wait: `max(suggested, computed)`, then jittered.
  ///
  /// The suggestion is capped at the ceiling so that a hostile or broken `Retry-After` cannot
  /// park a worker indefinitely.
  pub fn delay_for(&self, retry: u32, suggested: Option<Duration>) -> Duration {
    let computed = self.computed(retry);
    let delay = suggested.map_or(computed, |s| s.min(self.ceiling.max(computed)).max(computed));
    self.apply_jitter(delay)
  }

  fn apply_jitter(&self, delay: Duration) -> Duration {
    if self.jitter <= 0.0 || delay.is_zero() {
      return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
    delay.checked_add(delay.mul_f64(extra.min(1.0))).unwrap_or(Duration::MAX)
  }
}
