//! Run configuration.
//!
//! A [`Config`] is built exactly once at startup, either from a TOML file via [`Config::load`]
//! or programmatically with the `with_*` builders, and is then handed explicitly to every
//! component that needs it. Nothing in the library reads the environment after that point.
//!
//! # Examples
//!
//! ```toml
//! state_dir = "/var/lib/sifter"
//!
//! [llm]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//!
//! [rate_limit]
//! base_delay_ms = 500
//! max_retries = 4
//! concurrency = 4
//!
//! [pipeline]
//! fatal_failure_fraction = 0.5
//! topic = "soil organic carbon saturation"
//!
//! [[providers]]
//! name = "unpaywall"
//! endpoint_template = "https://api.unpaywall.org/v2/{identifier}?email={contact}"
//! identifier = "doi"
//! [providers.response_format]
//! type = "json"
//! location_path = "best_oa_location/url_for_pdf"
//! ```

use std::{collections::HashSet, time::Duration};

use super::*;
use crate::{backoff::BackoffPolicy, provider::ProviderConfig};

/// Environment variables consulted by [`Config::load`].
pub mod env {
  /// API key for the language model endpoint.
  pub const LLM_API_KEY: &str = "SIFTER_LLM_API_KEY";
  /// Fallback API key variable shared with OpenAI-compatible tooling.
  pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
  /// Base URL of the language model endpoint.
  pub const LLM_BASE_URL: &str = "SIFTER_LLM_BASE_URL";
  /// Fallback base URL variable shared with OpenAI-compatible tooling.
  pub const OPENAI_API_BASE: &str = "OPENAI_API_BASE";
  /// Model name.
  pub const LLM_MODEL: &str = "SIFTER_LLM_MODEL";
  /// Contact address passed to polite-pool APIs.
  pub const CONTACT_EMAIL: &str = "SIFTER_CONTACT_EMAIL";
  /// Root directory for checkpoints, artifacts and logs.
  pub const STATE_DIR: &str = "SIFTER_STATE_DIR";
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Root directory for checkpoints, the audit log, artifacts and log files.
  pub state_dir:   PathBuf,
  /// Language model endpoint settings.
  pub llm:         LlmConfig,
  /// Retry and throttling parameters shared by every outbound call.
  pub rate_limit:  RateLimitConfig,
  /// Scheduler behaviour.
  pub pipeline:    PipelineConfig,
  /// Document acquisition behaviour.
  pub acquisition: AcquisitionConfig,
  /// Document providers, in priority order.
  pub providers:   Vec<ProviderConfig>,
}

/// Settings for the OpenAI-compatible chat endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
  /// Base URL, e.g. `https://api.openai.com/v1`.
  pub base_url:     String,
  /// Bearer token. Usually supplied through the environment.
  pub api_key:      Option<String>,
  /// Model identifier.
  pub model:        String,
  /// Sampling temperature.
  pub temperature:  f32,
  /// Completion token cap per request.
  pub max_tokens:   u32,
  /// Per-request timeout in seconds.
  pub timeout_secs: u64,
}

/// Retry, backoff and throttling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  /// First backoff delay in milliseconds.
  pub base_delay_ms:   u64,
  /// Growth factor between consecutive delays.
  pub multiplier:      f64,
  /// Upper bound for any computed delay in milliseconds.
  pub max_delay_ms:    u64,
  /// Jitter ratio in `[0, 1]` applied on top of the computed delay.
  pub jitter:          f64,
  /// Retries after the first attempt for transient and rate-limited failures.
  pub max_retries:     u32,
  /// Simultaneous in-flight calls per target.
  pub concurrency:     usize,
  /// Minimum spacing between call starts per target, in milliseconds.
  pub min_interval_ms: u64,
}

/// Scheduler and stage processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Worker pool size within a stage.
  pub concurrency:            usize,
  /// Fraction of records that may fail before the run halts.
  pub fatal_failure_fraction: f64,
  /// Research topic passed to the screening and analysis prompts.
  pub topic:                  String,
  /// Inclusion criteria for screening.
  pub criteria:               String,
  /// Whether accepted records get their full text acquired and analyzed.
  pub deep_analysis:          bool,
  /// Maximum number of PDF pages fed to deep analysis.
  pub deep_max_pages:         usize,
  /// Only the first `analyze_top` accepted records (batch order) get deep analysis.
  pub analyze_top:            usize,
}

/// Acquisition chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
  /// Attempts allowed per (record, provider) pair before the pair is marked exhausted.
  pub retry_limit:           u32,
  /// Contact address substituted for `{contact}` in provider templates.
  pub contact_email:         Option<String>,
  /// Where downloaded artifacts go. Relative paths resolve against `state_dir`.
  pub artifact_dir:          PathBuf,
  /// Where operators drop manually obtained PDFs. Relative paths resolve against `state_dir`.
  pub manual_dir:            PathBuf,
  /// Timeout for a single artifact download.
  pub download_timeout_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      state_dir:   Self::default_state_dir(),
      llm:         LlmConfig::default(),
      rate_limit:  RateLimitConfig::default(),
      pipeline:    PipelineConfig::default(),
      acquisition: AcquisitionConfig::default(),
      providers:   Vec::new(),
    }
  }
}

impl Default for LlmConfig {
  fn default() -> Self {
    Self {
      base_url:     "https://api.openai.com/v1".to_string(),
      api_key:      None,
      model:        "gpt-4o-mini".to_string(),
      temperature:  0.1,
      max_tokens:   2000,
      timeout_secs: 60,
    }
  }
}

// Keeps the API key out of logs.
impl std::fmt::Debug for LlmConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LlmConfig")
      .field("base_url", &self.base_url)
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .field("model", &self.model)
      .field("temperature", &self.temperature)
      .field("max_tokens", &self.max_tokens)
      .field("timeout_secs", &self.timeout_secs)
      .finish()
  }
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      base_delay_ms:   500,
      multiplier:      2.0,
      max_delay_ms:    30_000,
      jitter:          0.2,
      max_retries:     3,
      concurrency:     4,
      min_interval_ms: 200,
    }
  }
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      concurrency:            4,
      fatal_failure_fraction: 0.5,
      topic:                  String::new(),
      criteria:               String::new(),
      deep_analysis:          false,
      deep_max_pages:         8,
      analyze_top:            20,
    }
  }
}

impl Default for AcquisitionConfig {
  fn default() -> Self {
    Self {
      retry_limit:           3,
      contact_email:         None,
      artifact_dir:          PathBuf::from("artifacts"),
      manual_dir:            PathBuf::from("manual"),
      download_timeout_secs: 120,
    }
  }
}

impl RateLimitConfig {
  /// The backoff policy described by these parameters.
  pub fn backoff(&self) -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(self.base_delay_ms))
      .with_multiplier(self.multiplier)
      .with_ceiling(Duration::from_millis(self.max_delay_ms))
      .with_jitter(self.jitter)
  }

  /// Minimum spacing between call starts.
  pub fn min_interval(&self) -> Duration { Duration::from_millis(self.min_interval_ms) }
}

impl Config {
  /// Returns the default configuration file path.
  ///
  /// - On Unix: `~/.config/sifter/config.toml`
  /// - On macOS: `~/Library/Application Support/sifter/config.toml`
  /// - Fallback: `./sifter/config.toml`
  pub fn default_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("sifter").join("config.toml")
  }

  /// Returns the default state directory (`<data dir>/sifter`).
  pub fn default_state_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("sifter")
  }

  /// Loads the configuration from `path` and applies the environment overlay.
  ///
  /// A missing file yields the defaults. A file that exists but does not parse is an error.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let config = if path.exists() {
      debug!("Loading configuration from {}", path.display());
      let content = std::fs::read_to_string(path)?;
      Self::from_toml(&content)?
    } else {
      debug!("No configuration at {}, using defaults", path.display());
      Self::default()
    };
    let config = config.with_env_overlay(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
  }

  /// Parses a configuration from a TOML string without touching the environment.
  pub fn from_toml(content: &str) -> Result<Self> { Ok(toml::from_str(content)?) }

  /// Applies environment overrides using `lookup` to resolve variables.
  pub fn with_env_overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
    if let Some(key) = lookup(env::LLM_API_KEY).or_else(|| lookup(env::OPENAI_API_KEY)) {
      self.llm.api_key = Some(key);
    }
    if let Some(url) = lookup(env::LLM_BASE_URL).or_else(|| lookup(env::OPENAI_API_BASE)) {
      self.llm.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(model) = lookup(env::LLM_MODEL) {
      self.llm.model = model;
    }
    if let Some(email) = lookup(env::CONTACT_EMAIL) {
      self.acquisition.contact_email = Some(email);
    }
    if let Some(dir) = lookup(env::STATE_DIR) {
      self.state_dir = PathBuf::from(dir);
    }
    self
  }

  /// Checks invariants that serde cannot express.
  pub fn validate(&self) -> Result<()> {
    let fraction = self.pipeline.fatal_failure_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
      return Err(SifterError::Config(format!(
        "pipeline.fatal_failure_fraction must be in (0, 1], got {fraction}"
      )));
    }
    if self.pipeline.concurrency == 0 || self.rate_limit.concurrency == 0 {
      return Err(SifterError::Config("concurrency must be at least 1".into()));
    }
    if self.acquisition.retry_limit == 0 {
      return Err(SifterError::Config("acquisition.retry_limit must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&self.rate_limit.jitter) {
      return Err(SifterError::Config("rate_limit.jitter must be in [0, 1]".into()));
    }
    let mut seen = HashSet::new();
    for provider in &self.providers {
      if !seen.insert(provider.name.as_str()) {
        return Err(SifterError::Config(format!("duplicate provider name '{}'", provider.name)));
      }
    }
    Ok(())
  }

  /// Sets the state directory.
  pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.state_dir = dir.into();
    self
  }

  /// Replaces the LLM settings.
  pub fn with_llm(mut self, llm: LlmConfig) -> Self {
    self.llm = llm;
    self
  }

  /// Replaces the rate-limit settings.
  pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
    self.rate_limit = rate_limit;
    self
  }

  /// Replaces the pipeline settings.
  pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
    self.pipeline = pipeline;
    self
  }

  /// Replaces the acquisition settings.
  pub fn with_acquisition(mut self, acquisition: AcquisitionConfig) -> Self {
    self.acquisition = acquisition;
    self
  }

  /// Appends a provider at the lowest priority.
  pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
    self.providers.push(provider);
    self
  }

  /// Directory holding all per-run state.
  pub fn runs_dir(&self) -> PathBuf { self.state_dir.join("runs") }

  /// Path of the append-only call audit database.
  pub fn audit_path(&self) -> PathBuf { self.state_dir.join("audit.db") }

  /// Directory for log files.
  pub fn log_dir(&self) -> PathBuf { self.state_dir.join("logs") }

  /// Resolved artifact directory.
  pub fn artifact_dir(&self) -> PathBuf { self.resolve(&self.acquisition.artifact_dir) }

  /// Resolved manual drop directory.
  pub fn manual_dir(&self) -> PathBuf { self.resolve(&self.acquisition.manual_dir) }

  fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.state_dir.join(path)
    }
  }
}
