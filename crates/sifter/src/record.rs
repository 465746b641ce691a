//! Bibliographic records and their lifecycle.
//!
//! A [`Record`] wraps an ingested [`Entry`] with everything the pipeline learns about it: its
//! [`Status`], the outputs of completed stages, and every [`AcquisitionAttempt`] made for it.
//!
//! Status changes go through the transition methods on [`Record`], which refuse to move a
//! record backwards. The only way back is [`Record::force_reset`], used when the operator
//! explicitly forces a re-run.

use sha2::{Digest, Sha256};

use super::*;
use crate::stage::Stage;

lazy_static! {
  static ref DOI_PATTERN: Regex = Regex::new(r"^10\.\d{4,9}/\S+$").expect("valid DOI pattern");
  static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid whitespace pattern");
}

/// Normalizes a DOI.
///
/// Strips resolver and `doi:` prefixes, trims whitespace and lowercases. Returns `None` when
/// the result does not look like a DOI.
///
/// # Examples
///
/// ```
/// use sifter::record::normalize_doi;
///
/// assert_eq!(normalize_doi("https://doi.org/10.1016/J.GEODERMA.2020.114"),
///            Some("10.1016/j.geoderma.2020.114".to_string()));
/// assert_eq!(normalize_doi("not a doi"), None);
/// ```
pub fn normalize_doi(raw: &str) -> Option<String> {
  let mut doi = raw.trim().to_lowercase();
  for prefix in ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/"]
  {
    if let Some(rest) = doi.strip_prefix(prefix) {
      doi = rest.to_string();
    }
  }
  if let Some(rest) = doi.strip_prefix("doi:") {
    doi = rest.trim().to_string();
  }
  DOI_PATTERN.is_match(&doi).then_some(doi)
}

/// Lowercases and collapses whitespace, used for title matching and hashing.
pub fn normalize_title(title: &str) -> String {
  WHITESPACE.replace_all(title.trim(), " ").to_lowercase()
}

/// Reads a year given as a number or a numeric string.
fn lenient_year<'de, D>(deserializer: D) -> std::result::Result<Option<i32>, D::Error>
where D: serde::Deserializer<'de> {
  Ok(match Value::deserialize(deserializer)? {
    Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  })
}

/// One bibliographic entry as ingested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
  /// Article title.
  #[serde(default)]
  pub title:         String,
  /// Author names in citation order.
  #[serde(default)]
  pub authors:       Vec<String>,
  /// Publication year. Numeric strings are accepted; anything else reads as absent.
  #[serde(default, deserialize_with = "lenient_year")]
  pub year:          Option<i32>,
  /// DOI as given. Normalized when the record id is derived.
  #[serde(default)]
  pub doi:           Option<String>,
  /// Abstract text.
  #[serde(default, rename = "abstract")]
  pub abstract_text: Option<String>,
  /// Journal or venue.
  #[serde(default)]
  pub journal:       Option<String>,
  /// Landing page URL.
  #[serde(default)]
  pub url:           Option<String>,
  /// Any other fields present in the input, carried through untouched.
  #[serde(flatten)]
  pub extra:         serde_json::Map<String, Value>,
}

impl Entry {
  /// The normalized DOI, if the entry has a valid one.
  pub fn normalized_doi(&self) -> Option<String> { self.doi.as_deref().and_then(normalize_doi) }

  /// Stable record identifier.
  ///
  /// `doi:<normalized doi>` when a DOI is present, otherwise `h:<sha256 of title|year>`.
  pub fn derive_id(&self) -> String {
    if let Some(doi) = self.normalized_doi() {
      return format!("doi:{doi}");
    }
    let mut hasher = Sha256::new();
    hasher.update(normalize_title(&self.title).as_bytes());
    hasher.update(b"|");
    if let Some(year) = self.year {
      hasher.update(year.to_string().as_bytes());
    }
    format!("h:{}", hex::encode(hasher.finalize()))
  }

  /// Abstract text if present and non-blank.
  pub fn abstract_text(&self) -> Option<&str> {
    self.abstract_text.as_deref().map(str::trim).filter(|s| !s.is_empty())
  }
}

/// Where a record is in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
  /// Not yet processed by any stage.
  Pending,
  /// A worker is processing the record.
  InProgress {
    /// Stage being processed.
    stage: Stage,
  },
  /// The full text was acquired during the stage.
  Acquired {
    /// Stage that acquired it.
    stage: Stage,
  },
  /// The stage finished successfully.
  StageComplete {
    /// Stage that finished.
    stage: Stage,
  },
  /// Every stage finished.
  Done,
  /// The record failed and will not be processed further in this run.
  Failed {
    /// Stage that failed.
    stage:  Stage,
    /// Why.
    reason: String,
  },
  /// The record was excluded from further processing.
  Skipped {
    /// Stage that excluded it.
    stage:  Stage,
    /// Why.
    reason: String,
  },
}

/// Rank of terminal states. Higher than any non-terminal rank.
const TERMINAL_RANK: usize = usize::MAX;

impl Status {
  /// Whether no further stage will run for the record.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Status::Done | Status::Failed { .. } | Status::Skipped { .. })
  }

  /// Whether a worker holds (or held, before a crash) the record.
  pub fn is_in_flight(&self) -> bool {
    matches!(self, Status::InProgress { .. } | Status::Acquired { .. })
  }

  /// Monotone position used to reject regressions.
  fn rank(&self) -> usize {
    match self {
      Status::Pending => 0,
      Status::InProgress { stage } => stage.index() * 3 + 1,
      Status::Acquired { stage } => stage.index() * 3 + 2,
      Status::StageComplete { stage } => stage.index() * 3 + 3,
      Status::Done | Status::Failed { .. } | Status::Skipped { .. } => TERMINAL_RANK,
    }
  }

  /// The status a record has right before `stage` starts.
  pub fn ready_for(stage: Stage) -> Status {
    stage.previous().map_or(Status::Pending, |prev| Status::StageComplete { stage: prev })
  }

  /// Stage the status refers to, if any.
  pub fn stage(&self) -> Option<Stage> {
    match self {
      Status::InProgress { stage }
      | Status::Acquired { stage }
      | Status::StageComplete { stage }
      | Status::Failed { stage, .. }
      | Status::Skipped { stage, .. } => Some(*stage),
      Status::Pending | Status::Done => None,
    }
  }

  /// Short label used in summaries and status tables.
  pub fn label(&self) -> &'static str {
    match self {
      Status::Pending => "pending",
      Status::InProgress { .. } => "in_progress",
      Status::Acquired { .. } => "acquired",
      Status::StageComplete { .. } => "stage_complete",
      Status::Done => "done",
      Status::Failed { .. } => "failed",
      Status::Skipped { .. } => "skipped",
    }
  }
}

impl std::fmt::Display for Status {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Status::Pending | Status::Done => f.write_str(self.label()),
      Status::InProgress { stage }
      | Status::Acquired { stage }
      | Status::StageComplete { stage } => write!(f, "{}({stage})", self.label()),
      Status::Failed { stage, reason } | Status::Skipped { stage, reason } =>
        write!(f, "{}({stage}: {reason})", self.label()),
    }
  }
}

/// A downloaded source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
  /// Provider that supplied it.
  pub provider: String,
  /// Where it came from (URL or original path).
  pub location: String,
  /// Local file.
  pub path:     PathBuf,
  /// Hex SHA-256 of the file contents.
  pub sha256:   String,
  /// File size.
  pub bytes:    u64,
}

/// Result of one (record, provider) trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
  /// The provider supplied the artifact.
  Success {
    /// The stored artifact.
    artifact: ArtifactRef,
  },
  /// The provider does not have the document.
  NotFound,
  /// The provider asked us to slow down.
  RateLimited {
    /// Suggested wait in milliseconds.
    #[serde(default)]
    retry_after_ms: Option<u64>,
  },
  /// Retryable failure.
  TransientError {
    /// Failure description.
    message: String,
  },
  /// Non-retryable failure.
  PermanentError {
    /// Failure description.
    message: String,
  },
  /// The retry budget ran out on rate limits or transient errors. Recorded in place of the
  /// last retryable outcome.
  Exhausted {
    /// Label of the last retryable outcome, e.g. `rate_limited`.
    last:   String,
    /// Detail of the last retryable outcome.
    #[serde(default)]
    detail: Option<String>,
  },
}

impl AttemptOutcome {
  /// Whether the (record, provider) pair must not be attempted again.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      AttemptOutcome::Success { .. }
        | AttemptOutcome::NotFound
        | AttemptOutcome::PermanentError { .. }
        | AttemptOutcome::Exhausted { .. }
    )
  }

  /// Short label for logs and audit rows.
  pub fn label(&self) -> &'static str {
    match self {
      AttemptOutcome::Success { .. } => "success",
      AttemptOutcome::NotFound => "not_found",
      AttemptOutcome::RateLimited { .. } => "rate_limited",
      AttemptOutcome::TransientError { .. } => "transient_error",
      AttemptOutcome::PermanentError { .. } => "permanent_error",
      AttemptOutcome::Exhausted { .. } => "exhausted",
    }
  }

  /// Marks a retryable outcome as the last one the budget allows.
  pub fn exhaust(self) -> Self {
    let detail = match &self {
      AttemptOutcome::TransientError { message } => Some(message.clone()),
      AttemptOutcome::RateLimited { retry_after_ms } =>
        retry_after_ms.map(|ms| format!("retry after {ms}ms")),
      _ => return self,
    };
    AttemptOutcome::Exhausted { last: self.label().to_string(), detail }
  }
}

/// One recorded trial of a provider for a record. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionAttempt {
  /// Provider name.
  pub provider: String,
  /// Run in which the attempt was made.
  pub run_id:   String,
  /// 1-based attempt number for this pair within the run.
  pub attempt:  u32,
  /// What happened.
  #[serde(flatten)]
  pub outcome:  AttemptOutcome,
  /// When it happened.
  pub at:       DateTime<Utc>,
}

/// One bibliographic entity moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  /// Stable identifier, unique within a run.
  pub id:       String,
  /// The ingested entry.
  pub entry:    Entry,
  status:       Status,
  /// Outputs of completed stages.
  #[serde(default)]
  pub outputs:  BTreeMap<Stage, Value>,
  /// Acquisition attempts in insertion order.
  #[serde(default)]
  pub attempts: Vec<AcquisitionAttempt>,
  /// The acquired full text, if any.
  #[serde(default)]
  pub artifact: Option<ArtifactRef>,
  /// Last status change.
  pub updated:  DateTime<Utc>,
}

impl Record {
  /// Creates a pending record with an id derived from the entry.
  pub fn new(entry: Entry) -> Self {
    Self {
      id: entry.derive_id(),
      entry,
      status: Status::Pending,
      outputs: BTreeMap::new(),
      attempts: Vec::new(),
      artifact: None,
      updated: Utc::now(),
    }
  }

  /// Current status.
  pub fn status(&self) -> &Status { &self.status }

  /// Output recorded by `stage`, if it completed.
  pub fn output(&self, stage: Stage) -> Option<&Value> { self.outputs.get(&stage) }

  /// Whether the record is waiting for `stage`.
  pub fn is_ready_for(&self, stage: Stage) -> bool { self.status == Status::ready_for(stage) }

  fn transition(&mut self, to: Status) -> Result<()> {
    if self.status.is_terminal() || to.rank() < self.status.rank() {
      return Err(SifterError::StatusRegression {
        id:   self.id.clone(),
        from: self.status.to_string(),
        to:   to.to_string(),
      });
    }
    self.status = to;
    self.updated = Utc::now();
    Ok(())
  }

  /// Marks the record as being processed by `stage`.
  pub(crate) fn begin(&mut self, stage: Stage) -> Result<()> {
    self.transition(Status::InProgress { stage })
  }

  /// Marks that the full text was acquired during `stage`.
  pub(crate) fn mark_acquired(&mut self, stage: Stage) -> Result<()> {
    self.transition(Status::Acquired { stage })
  }

  /// Records the output of `stage`. Moves to [`Status::Done`] after the last stage.
  pub(crate) fn complete(&mut self, stage: Stage, output: Value) -> Result<()> {
    let to = if stage.is_last() { Status::Done } else { Status::StageComplete { stage } };
    self.transition(to)?;
    self.outputs.insert(stage, output);
    Ok(())
  }

  /// Marks the record failed at `stage`.
  pub(crate) fn fail(&mut self, stage: Stage, reason: impl Into<String>) -> Result<()> {
    self.transition(Status::Failed { stage, reason: reason.into() })
  }

  /// Marks the record skipped at `stage`.
  pub(crate) fn skip(&mut self, stage: Stage, reason: impl Into<String>) -> Result<()> {
    self.transition(Status::Skipped { stage, reason: reason.into() })
  }

  /// Reverts an in-flight status to the state before its stage started.
  ///
  /// Called on records loaded from a checkpoint, and on records abandoned when a run halts.
  /// Returns whether anything changed.
  pub(crate) fn revalidate(&mut self) -> bool {
    match self.status {
      Status::InProgress { stage } | Status::Acquired { stage } => {
        self.status = Status::ready_for(stage);
        self.updated = Utc::now();
        true
      },
      _ => false,
    }
  }

  /// Moves a record back so that `stage` runs again, bypassing the regression check.
  ///
  /// Records that stopped before reaching `stage` are left alone. Outputs of `stage` and later
  /// stages are discarded. Returns whether the record was reset.
  pub(crate) fn force_reset(&mut self, stage: Stage) -> bool {
    let reached = match &self.status {
      Status::Done => true,
      Status::Failed { stage: at, .. } | Status::Skipped { stage: at, .. } => *at >= stage,
      other => other.rank() > Status::ready_for(stage).rank(),
    };
    if !reached {
      return false;
    }
    self.status = Status::ready_for(stage);
    self.outputs.retain(|s, _| *s < stage);
    self.updated = Utc::now();
    true
  }

  /// Appends an attempt.
  pub(crate) fn record_attempt(&mut self, attempt: AcquisitionAttempt) {
    self.attempts.push(attempt);
  }

  /// The first terminal attempt for `provider` from any run.
  pub fn terminal_attempt(&self, provider: &str) -> Option<&AcquisitionAttempt> {
    self.attempts.iter().find(|a| a.provider == provider && a.outcome.is_terminal())
  }

  /// Number of attempts made for `provider` during `run_id`.
  pub fn attempts_in_run(&self, provider: &str, run_id: &str) -> u32 {
    self.attempts.iter().filter(|a| a.provider == provider && a.run_id == run_id).count() as u32
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(title: &str, year: Option<i32>, doi: Option<&str>) -> Entry {
    Entry {
      title: title.into(),
      year,
      doi: doi.map(Into::into),
      ..Entry::default()
    }
  }

  #[test]
  fn ids_prefer_doi() {
    let a = entry("Soil carbon", Some(2020), Some("DOI:10.1000/ABC"));
    let b = entry("Another title", None, Some("https://doi.org/10.1000/abc"));
    assert_eq!(a.derive_id(), "doi:10.1000/abc");
    assert_eq!(a.derive_id(), b.derive_id());
  }

  #[test]
  fn ids_fall_back_to_title_hash() {
    let a = entry("Soil   Carbon ", Some(2020), None);
    let b = entry("soil carbon", Some(2020), Some("garbage"));
    let c = entry("soil carbon", Some(2021), None);
    assert!(a.derive_id().starts_with("h:"));
    assert_eq!(a.derive_id(), b.derive_id());
    assert_ne!(a.derive_id(), c.derive_id());
  }

  #[test]
  fn status_never_regresses() {
    let mut record = Record::new(entry("t", None, None));
    record.begin(Stage::Preprocess).unwrap();
    record.complete(Stage::Preprocess, Value::Null).unwrap();
    record.begin(Stage::Screen).unwrap();
    let err = record.begin(Stage::Preprocess).unwrap_err();
    assert!(matches!(err, SifterError::StatusRegression { .. }));
    record.skip(Stage::Screen, "screened out").unwrap();
    assert!(record.begin(Stage::Analyze).is_err());
  }

  #[test]
  fn last_stage_completes_to_done() {
    let mut record = Record::new(entry("t", None, None));
    for stage in Stage::ALL {
      record.begin(stage).unwrap();
      record.complete(stage, Value::Bool(true)).unwrap();
    }
    assert_eq!(record.status(), &Status::Done);
    assert_eq!(record.outputs.len(), 4);
  }

  #[test]
  fn revalidate_reverts_in_flight() {
    let mut record = Record::new(entry("t", None, None));
    record.begin(Stage::Preprocess).unwrap();
    record.complete(Stage::Preprocess, Value::Null).unwrap();
    record.begin(Stage::Screen).unwrap();
    assert!(record.revalidate());
    assert!(record.is_ready_for(Stage::Screen));
    assert!(!record.revalidate());
  }

  #[test]
  fn force_reset_only_touches_records_that_reached_the_stage() {
    let mut done = Record::new(entry("a", None, None));
    for stage in Stage::ALL {
      done.begin(stage).unwrap();
      done.complete(stage, Value::Null).unwrap();
    }
    assert!(done.force_reset(Stage::Analyze));
    assert!(done.is_ready_for(Stage::Analyze));
    assert!(done.output(Stage::Screen).is_some());
    assert!(done.output(Stage::Analyze).is_none());

    let mut early = Record::new(entry("b", None, None));
    early.begin(Stage::Preprocess).unwrap();
    early.skip(Stage::Preprocess, "no title").unwrap();
    assert!(!early.force_reset(Stage::Screen));
    assert!(early.status().is_terminal());
  }

  #[test]
  fn status_round_trips_through_json() {
    let status = Status::Failed { stage: Stage::Analyze, reason: "exhausted".into() };
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "failed");
    assert_eq!(json["stage"], "analyze");
    assert_eq!(serde_json::from_value::<Status>(json).unwrap(), status);
  }

  #[test]
  fn only_retryable_outcomes_are_exhausted() {
    let limited = AttemptOutcome::RateLimited { retry_after_ms: Some(500) }.exhaust();
    assert!(limited.is_terminal());
    assert_eq!(limited, AttemptOutcome::Exhausted {
      last:   "rate_limited".into(),
      detail: Some("retry after 500ms".into()),
    });
    assert_eq!(AttemptOutcome::NotFound.exhaust(), AttemptOutcome::NotFound);
  }

  #[test]
  fn unknown_entry_fields_are_kept() {
    let entry: Entry = serde_json::from_str(
      r#"{"title": "t", "abstract": "a", "Times Cited": 4}"#,
    )
    .unwrap();
    assert_eq!(entry.abstract_text(), Some("a"));
    assert_eq!(entry.extra["Times Cited"], 4);
  }

  #[test]
  fn years_are_read_leniently() {
    let years: Vec<Option<i32>> = [r#"{"year": 2020}"#, r#"{"year": " 2019 "}"#, r#"{"year": "n.d."}"#, "{}"]
      .iter()
      .map(|json| serde_json::from_str::<Entry>(json).unwrap().year)
      .collect();
    assert_eq!(years, vec![Some(2020), Some(2019), None, None]);
  }
}
