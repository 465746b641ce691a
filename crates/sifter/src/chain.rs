//! The acquisition fallback chain.
//!
//! [`AcquisitionChain::acquire`] walks the configured providers in priority order until one
//! yields a PDF. For each provider:
//!
//! - a terminal outcome recorded earlier (in this run or any previous one) is honored and the
//!   provider is not dispatched again, unless acquisition is forced;
//! - otherwise the provider is tried, through [`RateLimitedClient::call_once`], until it returns a
//!   terminal outcome or has been tried `retry_limit` times. The last allowed rate-limited or
//!   transient attempt is recorded as [`AttemptOutcome::Exhausted`], which is terminal too;
//! - `not_found` and permanent errors move on to the next provider. A `not_found` from one
//!   provider says nothing about the others, so the chain never stops early on it.
//!
//! Every dispatch is appended to [`Record::attempts`] before the next one starts.

use super::*;
use crate::{
  client::{Operation, RateLimitedClient},
  config::Config,
  provider::{ArtifactFetcher, Identifier, Lookup, Provider},
  record::{AcquisitionAttempt, ArtifactRef, AttemptOutcome, Record},
};

/// Result of running the chain for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionResult {
  /// A provider supplied the artifact.
  Acquired(ArtifactRef),
  /// Every provider was exhausted.
  Exhausted {
    /// Providers in priority order.
    providers: Vec<String>,
  },
}

/// Ordered list of providers plus the machinery to call them.
pub struct AcquisitionChain {
  providers:   Vec<Arc<dyn Provider>>,
  client:      Arc<RateLimitedClient>,
  fetcher:     ArtifactFetcher,
  retry_limit: u32,
}

impl AcquisitionChain {
  /// Creates a chain over `providers`, highest priority first.
  pub fn new(
    providers: Vec<Arc<dyn Provider>>,
    client: Arc<RateLimitedClient>,
    fetcher: ArtifactFetcher,
    retry_limit: u32,
  ) -> Self {
    Self { providers, client, fetcher, retry_limit: retry_limit.max(1) }
  }

  /// Builds the chain described by `config`.
  pub fn from_config(config: &Config, client: Arc<RateLimitedClient>) -> Result<Self> {
    let providers = crate::provider::build_providers(config, &client)?;
    let fetcher = ArtifactFetcher::new(
      client.http().clone(),
      config.artifact_dir(),
      std::time::Duration::from_secs(config.acquisition.download_timeout_secs),
    );
    Ok(Self::new(providers, client, fetcher, config.acquisition.retry_limit))
  }

  /// Provider names in priority order.
  pub fn provider_names(&self) -> Vec<String> {
    self.providers.iter().map(|p| p.name().to_string()).collect()
  }

  /// Tries to obtain the full text of `record`.
  ///
  /// Attempts are recorded on `record`, and on success the artifact is attached to it. With
  /// `force`, outcomes recorded earlier are ignored and every provider gets a fresh
  /// `retry_limit`.
  pub async fn acquire(&self, record: &mut Record, run_id: &str, force: bool) -> AcquisitionResult {
    let identifier = Identifier::from_record(record);

    for provider in &self.providers {
      let name = provider.name();

      if !force {
        if let Some(prior) = record.terminal_attempt(name) {
          if let AttemptOutcome::Success { artifact } = &prior.outcome {
            debug!("{} already acquired from {name}", record.id);
            let artifact = artifact.clone();
            record.artifact = Some(artifact.clone());
            return AcquisitionResult::Acquired(artifact);
          }
          trace!("Skipping {name} for {}: {} in run {}", record.id, prior.outcome.label(), prior.run_id);
          continue;
        }
      }

      let mut made = if force { 0 } else { record.attempts_in_run(name, run_id) };
      while made < self.retry_limit {
        made += 1;
        let mut outcome = self.dispatch(provider.as_ref(), &identifier, made).await;
        if made == self.retry_limit {
          outcome = outcome.exhaust();
        }
        debug!("{} via {name} (attempt {made}/{}): {}", record.id, self.retry_limit, outcome.label());

        let retry_after = match &outcome {
          AttemptOutcome::RateLimited { retry_after_ms } =>
            retry_after_ms.map(std::time::Duration::from_millis),
          _ => None,
        };
        let terminal = outcome.is_terminal();
        let artifact = match &outcome {
          AttemptOutcome::Success { artifact } => Some(artifact.clone()),
          _ => None,
        };
        record.record_attempt(AcquisitionAttempt {
          provider: name.to_string(),
          run_id: run_id.to_string(),
          attempt: made,
          outcome,
          at: Utc::now(),
        });

        if let Some(artifact) = artifact {
          info!("Acquired {} from {name}", record.id);
          record.artifact = Some(artifact.clone());
          return AcquisitionResult::Acquired(artifact);
        }
        if terminal {
          break;
        }
        if made < self.retry_limit {
          tokio::time::sleep(self.client.backoff().delay_for(made - 1, retry_after)).await;
        }
      }
    }

    warn!("No provider could supply {}", record.id);
    AcquisitionResult::Exhausted { providers: self.provider_names() }
  }

  /// One throttled lookup-and-fetch against `provider`.
  async fn dispatch(
    &self,
    provider: &dyn Provider,
    identifier: &Identifier,
    number: u32,
  ) -> AttemptOutcome {
    let operation = Operation::new(provider.name(), "acquire");
    let result = self
      .client
      .call_once(&operation, number, || async {
        match provider.lookup(identifier).await {
          Lookup::Found(location) =>
            self.fetcher.store(&identifier.record_id, provider.name(), &location).await,
          Lookup::NotFound => Ok(None),
          Lookup::RateLimited { retry_after } => Err(CallError::RateLimited { retry_after }),
          Lookup::Error(e) => Err(e),
        }
      })
      .await;

    match result {
      Ok(Some(artifact)) => AttemptOutcome::Success { artifact },
      Ok(None) => AttemptOutcome::NotFound,
      Err(CallError::RateLimited { retry_after }) =>
        AttemptOutcome::RateLimited { retry_after_ms: retry_after.map(|d| d.as_millis() as u64) },
      Err(CallError::Transient(message)) => AttemptOutcome::TransientError { message },
      Err(CallError::Permanent(message)) => AttemptOutcome::PermanentError { message },
    }
  }
}
