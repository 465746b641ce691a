//! Resumable literature screening pipeline with multi-source document acquisition.
//!
//! `sifter` takes a batch of bibliographic entries and moves each of them through four ordered
//! stages:
//!
//! - **preprocess**: validate and normalize the entry
//! - **screen**: ask a language model whether the paper meets the inclusion criteria
//! - **analyze**: extract a summary and, for the most relevant papers, acquire the PDF and
//!   analyze the full text
//! - **report**: assemble the report entry
//!
//! # Features
//!
//! - **Resumable runs**: every finished record is checkpointed atomically, so an interrupted run
//!   picks up where it stopped without repeating finished work
//! - **Fallback acquisition**: full texts are looked up through an ordered list of providers
//!   (open access aggregators, metadata services, institutional proxies, a manual drop folder),
//!   and each (record, provider) pair is tried a bounded number of times, across runs
//! - **Polite outbound calls**: every model and provider call goes through one throttled client
//!   with per-target concurrency caps, spacing, exponential backoff with jitter, and an
//!   append-only audit log
//! - **Contained failures**: a bad record fails alone; only too many failures, or an unwritable
//!   checkpoint, stop the run
//!
//! # Getting Started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sifter::{
//!   checkpoint::CheckpointStore,
//!   client::RateLimitedClient,
//!   config::Config,
//!   ingest,
//!   llm::{ChatClient, LanguageModel},
//!   scheduler::{RunOptions, StageScheduler},
//!   stage::Stage,
//!   stages,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = Config::load(Config::default_path())?;
//!   let client = Arc::new(RateLimitedClient::new(&config.rate_limit));
//!   let llm: Arc<dyn LanguageModel> = Arc::new(ChatClient::new(&config.llm, client)?);
//!
//!   let processors = stages::build(&Stage::ALL, &config.pipeline, Some(llm), None)?;
//!   let store = Arc::new(CheckpointStore::new(config.runs_dir()));
//!   let scheduler = StageScheduler::new(store, &config.pipeline).with_processors(processors);
//!
//!   let records = ingest::load("savedrecs.json", None).await?;
//!   let summary = scheduler.run(&RunOptions::new("first-run"), Some(records)).await?;
//!   println!("{} papers made it through", summary.done);
//!   Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`record`], [`stage`]: the data model and the processor interface
//! - [`checkpoint`]: durable run state
//! - [`backoff`], [`client`], [`audit`]: throttled outbound calls
//! - [`provider`], [`chain`]: full-text acquisition
//! - [`llm`], [`prompts`], [`pdf`], [`stages`]: the standard stage processors
//! - [`scheduler`], [`progress`]: running and observing a batch
//! - [`synthesis`]: the run report
//! - [`config`], [`ingest`]: getting configuration and entries in

#![warn(missing_docs)]

use std::{
  collections::{BTreeMap, HashMap},
  path::{Path, PathBuf},
  str::FromStr,
  sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
#[cfg(test)]
use {tempfile::tempdir, tracing_test::traced_test};

pub mod audit;
pub mod backoff;
pub mod chain;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod pdf;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod record;
pub mod scheduler;
pub mod stage;
pub mod stages;
pub mod synthesis;

use crate::error::*;

/// Common traits and types for ergonomic imports.
///
/// # Usage
///
/// ```no_run
/// use sifter::prelude::*;
///
/// async fn resume(scheduler: &StageScheduler) -> Result<RunSummary, SifterError> {
///   scheduler.run(&RunOptions::new("20240131-154502"), None).await
/// }
/// ```
pub mod prelude {
  pub use crate::{
    error::SifterError,
    llm::LanguageModel,
    progress::ProgressReporter,
    provider::Provider,
    scheduler::{RunOptions, RunSummary, StageScheduler},
    stage::{Stage, StageOutcome, StageProcessor},
  };
}
