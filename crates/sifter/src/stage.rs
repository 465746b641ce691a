//! Pipeline stages and the processor interface.
//!
//! Every record moves through [`Stage::ALL`] in order. Each stage is implemented by a
//! [`StageProcessor`], which the [`StageScheduler`](crate::scheduler::StageScheduler) calls
//! once per eligible record. Processors hold only immutable configuration and shared clients,
//! so calling one twice with the same record yields the same outcome (modulo the language model
//! itself). This is what makes re-entering a stage after a crash safe.

use std::fmt::Display;

use super::*;
use crate::record::Record;

/// One ordered phase of processing.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  /// Validation and normalization of ingested entries.
  Preprocess,
  /// Relevance screening.
  Screen,
  /// Summary and data extraction, optionally with full-text acquisition.
  Analyze,
  /// Assembly of the final report entry.
  Report,
}

impl Stage {
  /// Every stage, in execution order.
  pub const ALL: [Stage; 4] = [Stage::Preprocess, Stage::Screen, Stage::Analyze, Stage::Report];

  /// Position of this stage in [`Stage::ALL`].
  pub fn index(self) -> usize {
    match self {
      Stage::Preprocess => 0,
      Stage::Screen => 1,
      Stage::Analyze => 2,
      Stage::Report => 3,
    }
  }

  /// The stage before this one, if any.
  pub fn previous(self) -> Option<Stage> { self.index().checked_sub(1).map(|i| Self::ALL[i]) }

  /// Whether this is the final stage.
  pub fn is_last(self) -> bool { self == Stage::Report }

  /// Whether the stage calls the language model.
  pub fn needs_llm(self) -> bool { matches!(self, Stage::Screen | Stage::Analyze) }

  /// Lowercase name as used on the command line and in checkpoints.
  pub fn as_str(self) -> &'static str {
    match self {
      Stage::Preprocess => "preprocess",
      Stage::Screen => "screen",
      Stage::Analyze => "analyze",
      Stage::Report => "report",
    }
  }

  /// Parses a comma separated stage list such as `screen,analyze`.
  ///
  /// The result is deduplicated and sorted into execution order.
  pub fn parse_list(list: &str) -> Result<Vec<Stage>> {
    let mut stages = list
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(Stage::from_str)
      .collect::<Result<Vec<_>>>()?;
    stages.sort();
    stages.dedup();
    if stages.is_empty() {
      return Err(SifterError::Config("no stages selected".into()));
    }
    Ok(stages)
  }
}

impl Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Stage {
  type Err = SifterError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "preprocess" => Ok(Stage::Preprocess),
      "screen" => Ok(Stage::Screen),
      "analyze" | "analyse" => Ok(Stage::Analyze),
      "report" => Ok(Stage::Report),
      other => Err(SifterError::Config(format!("unknown stage '{other}'"))),
    }
  }
}

/// What a processor concluded about one record.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
  /// The stage finished; the value is stored as the stage output on the record.
  Success(Value),
  /// The stage failed for this record. Counts toward the fatal threshold.
  Failure(String),
  /// The record is excluded from further processing, e.g. screened out.
  Skip(String),
  /// Full text was required but no provider could supply it. The record goes to the manual
  /// queue and does not count toward the fatal threshold.
  Unacquirable {
    /// Providers that were tried or had terminal outcomes.
    providers: Vec<String>,
  },
}

/// Per-call context handed to processors by the scheduler.
#[derive(Debug, Clone)]
pub struct StageContext {
  /// Identifier of the current run.
  pub run_id:        String,
  /// Stage being executed.
  pub stage:         Stage,
  /// Position of the record among the records still in the pipeline, in batch order.
  pub ordinal:       usize,
  /// Whether prior terminal acquisition outcomes should be ignored.
  pub force_acquire: bool,
}

/// A per-stage record processor.
///
/// Implementations must be safe to re-invoke with identical input. The record passed in is a
/// working copy: processors may append acquisition attempts or attach an artifact, and the
/// scheduler merges the copy back after applying the outcome.
#[async_trait]
pub trait StageProcessor: Send + Sync {
  /// The stage this processor implements.
  fn stage(&self) -> Stage;

  /// Processes one record.
  ///
  /// Returning `Err` is allowed for any failure. Validation errors become skips, run-fatal
  /// errors halt the run, and everything else becomes a per-record failure.
  async fn process(&self, record: &mut Record, ctx: &StageContext) -> Result<StageOutcome>;
}
