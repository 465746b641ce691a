//! Driving a batch of records through the stages.
//!
//! [`StageScheduler::run`] loads (or creates) the checkpoint of a run and executes the selected
//! stages one after another. Within a stage, up to `concurrency` records are processed at a
//! time; stage *k+1* starts only after every record eligible for stage *k* has been dispatched
//! and has finished.
//!
//! The scheduler is the only writer of run state. Processors work on a copy of the record, and
//! the scheduler applies their outcome and saves the checkpoint after every finished record. A
//! crash therefore loses at most the records that were in flight, which are reverted to their
//! pre-stage status on the next load and processed again.
//!
//! A run stops early in three cases:
//! - the [`Shutdown`] flag is raised: no new records are dispatched, in-flight records finish,
//!   and the checkpoint is saved;
//! - more than `fatal_failure_fraction` of the records have failed: no new records are
//!   dispatched, records already in flight finish and are applied, the checkpoint is saved, and
//!   [`SifterError::FatalThreshold`] is returned;
//! - a processor reports a run-fatal error, which is returned after the same drain. The record
//!   that raised it is reverted to its pre-stage status. When the store itself cannot be
//!   written, the error is returned immediately.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sifter::{
//!   checkpoint::CheckpointStore,
//!   config::Config,
//!   ingest,
//!   scheduler::{RunOptions, StageScheduler},
//!   stage::Stage,
//!   stages::PreprocessProcessor,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let store = Arc::new(CheckpointStore::new(config.runs_dir()));
//! let scheduler = StageScheduler::new(store, &config.pipeline)
//!   .with_processor(Arc::new(PreprocessProcessor));
//!
//! let records = ingest::load("entries.json", None).await?;
//! let options = RunOptions::new(RunOptions::fresh_run_id()).with_stages(vec![Stage::Preprocess]);
//! let summary = scheduler.run(&options, Some(records)).await?;
//! println!("{} done, {} failed", summary.done, summary.failed);
//! # Ok(())
//! # }
//! ```

use std::{
  collections::HashSet,
  sync::atomic::{AtomicBool, Ordering},
  time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, StreamExt};

use super::*;
use crate::{
  checkpoint::{Checkpoint, CheckpointStore, ManualQueueEntry},
  config::PipelineConfig,
  progress::{ProgressReporter, RunEvent},
  record::{Record, Status},
  stage::{Stage, StageContext, StageOutcome, StageProcessor},
};

/// Failure reason of records whose full text no provider could supply.
pub const EXHAUSTED: &str = "exhausted";

/// Cooperative cancellation flag shared between the scheduler and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
  /// Asks the run to stop after the records in flight.
  pub fn trigger(&self) { self.0.store(true, Ordering::SeqCst) }

  /// Whether a stop was requested.
  pub fn is_triggered(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
  /// Run identifier. An existing checkpoint with this id is resumed.
  pub run_id:        String,
  /// Stages to execute, in order.
  pub stages:        Vec<Stage>,
  /// Re-run records that already went past the first selected stage.
  pub force:         bool,
  /// Ignore acquisition outcomes recorded by earlier runs.
  pub force_acquire: bool,
}

impl RunOptions {
  /// All stages, nothing forced.
  pub fn new(run_id: impl Into<String>) -> Self {
    Self { run_id: run_id.into(), stages: Stage::ALL.to_vec(), force: false, force_acquire: false }
  }

  /// Restricts the run to `stages`. They are put in execution order.
  pub fn with_stages(mut self, mut stages: Vec<Stage>) -> Self {
    stages.sort();
    stages.dedup();
    self.stages = stages;
    self
  }

  /// Sets [`force`](Self::force).
  pub fn with_force(mut self, force: bool) -> Self {
    self.force = force;
    self
  }

  /// Sets [`force_acquire`](Self::force_acquire).
  pub fn with_force_acquire(mut self, force_acquire: bool) -> Self {
    self.force_acquire = force_acquire;
    self
  }

  /// A run id derived from the current time, e.g. `20240131-154502`.
  pub fn fresh_run_id() -> String { Utc::now().format("%Y%m%d-%H%M%S").to_string() }
}

/// Counts per terminal state at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
  /// Run identifier.
  pub run_id:       String,
  /// Records in the run.
  pub total:        usize,
  /// Records that went through every stage.
  pub done:         usize,
  /// Records that failed, including those waiting for manual acquisition.
  pub failed:       usize,
  /// Records excluded along the way.
  pub skipped:      usize,
  /// Records not in a terminal state, e.g. because not every stage was selected.
  pub unfinished:   usize,
  /// Length of the manual-intervention queue.
  pub manual_queue: usize,
  /// Whether the run was stopped by a shutdown request.
  pub interrupted:  bool,
  /// Wall time of this invocation.
  pub elapsed:      Duration,
}

impl RunSummary {
  /// Summarizes the persisted state of a run.
  pub fn from_checkpoint(checkpoint: &Checkpoint, interrupted: bool, elapsed: Duration) -> Self {
    let counts = checkpoint.terminal_counts();
    let count = |key: &str| counts.get(key).copied().unwrap_or(0);
    Self {
      run_id: checkpoint.run_id.clone(),
      total: checkpoint.records.len(),
      done: count("done"),
      failed: count("failed"),
      skipped: count("skipped"),
      unfinished: count("unfinished"),
      manual_queue: checkpoint.manual_queue.len(),
      interrupted,
      elapsed,
    }
  }
}

/// Failed records that count toward the fatal threshold. Records waiting for manual acquisition
/// do not: failing to find a full text is expected.
fn counted_failures(checkpoint: &Checkpoint) -> usize {
  let queued: HashSet<&str> = checkpoint.manual_queue.iter().map(|e| e.id.as_str()).collect();
  checkpoint
    .records
    .iter()
    .filter(|r| matches!(r.status(), Status::Failed { .. }) && !queued.contains(r.id.as_str()))
    .count()
}

/// Why a stage loop ended before its queue was empty.
enum Halt {
  Interrupted,
  Fatal(SifterError),
}

/// Runs stages over a batch of records. See the module docs.
pub struct StageScheduler {
  store:          Arc<CheckpointStore>,
  processors:     BTreeMap<Stage, Arc<dyn StageProcessor>>,
  reporters:      Vec<Arc<dyn ProgressReporter>>,
  concurrency:    usize,
  fatal_fraction: f64,
  shutdown:       Shutdown,
}

impl StageScheduler {
  /// Creates a scheduler persisting to `store`, with the limits in `config`.
  pub fn new(store: Arc<CheckpointStore>, config: &PipelineConfig) -> Self {
    Self {
      store,
      processors: BTreeMap::new(),
      reporters: Vec::new(),
      concurrency: config.concurrency.max(1),
      fatal_fraction: config.fatal_failure_fraction,
      shutdown: Shutdown::default(),
    }
  }

  /// Registers the processor of its stage, replacing any earlier one.
  pub fn with_processor(mut self, processor: Arc<dyn StageProcessor>) -> Self {
    self.processors.insert(processor.stage(), processor);
    self
  }

  /// Registers several processors.
  pub fn with_processors(
    self,
    processors: impl IntoIterator<Item = Arc<dyn StageProcessor>>,
  ) -> Self {
    processors.into_iter().fold(self, Self::with_processor)
  }

  /// Adds a progress reporter.
  pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
    self.reporters.push(reporter);
    self
  }

  /// Uses `shutdown` as the cancellation flag.
  pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
    self.shutdown = shutdown;
    self
  }

  /// The cancellation flag of this scheduler.
  pub fn shutdown(&self) -> Shutdown { self.shutdown.clone() }

  fn emit(&self, event: RunEvent) {
    for reporter in &self.reporters {
      reporter.on_event(&event);
    }
  }

  async fn persist(&self, checkpoint: &mut Checkpoint) -> Result<()> {
    checkpoint.updated_at = Utc::now();
    self.store.save(checkpoint).await
  }

  fn threshold_error(&self, checkpoint: &Checkpoint) -> Option<SifterError> {
    let total = checkpoint.records.len();
    let failed = counted_failures(checkpoint);
    (total > 0 && failed as f64 > self.fatal_fraction * total as f64).then(|| {
      SifterError::FatalThreshold { failed, total, threshold: self.fatal_fraction }
    })
  }

  /// Runs (or resumes) the run described by `options`.
  ///
  /// An existing checkpoint for the run id is always resumed and `input` is ignored. Without a
  /// checkpoint, `input` becomes the batch of a new run.
  pub async fn run(&self, options: &RunOptions, input: Option<Vec<Record>>) -> Result<RunSummary> {
    let started = Instant::now();
    if options.stages.is_empty() {
      return Err(SifterError::Config("no stages selected".into()));
    }
    if let Some(stage) = options.stages.iter().find(|s| !self.processors.contains_key(*s)) {
      return Err(SifterError::Config(format!("no processor registered for stage '{stage}'")));
    }

    let (mut checkpoint, resumed) = match self.store.load(&options.run_id).await? {
      Some(checkpoint) => {
        if input.is_some() {
          warn!(run_id = %options.run_id, "Resuming from checkpoint; ignoring the new input");
        }
        (checkpoint, true)
      },
      None => {
        let records = input.ok_or_else(|| {
          SifterError::Config(format!("run '{}' has no checkpoint and no input", options.run_id))
        })?;
        (Checkpoint::new(options.run_id.clone(), records), false)
      },
    };

    let reverted = checkpoint.records.iter_mut().map(Record::revalidate).filter(|&r| r).count();
    if reverted > 0 {
      info!(run_id = %checkpoint.run_id, "Re-validated {reverted} records left in flight");
    }
    if options.force {
      self.force_reset(&mut checkpoint, options.stages[0]);
    }
    self.persist(&mut checkpoint).await?;
    self.emit(RunEvent::RunStarted {
      run_id: checkpoint.run_id.clone(),
      records: checkpoint.records.len(),
      resumed,
    });

    let mut halt = self.threshold_error(&checkpoint).map(Halt::Fatal);
    for &stage in &options.stages {
      if halt.is_some() {
        break;
      }
      if self.shutdown.is_triggered() {
        halt = Some(Halt::Interrupted);
        break;
      }
      halt = self.run_stage(&mut checkpoint, stage, options).await?;
      if halt.is_none() {
        checkpoint.stage_cursor = checkpoint.stage_cursor.max(stage.index() + 1);
        self.persist(&mut checkpoint).await?;
        self.emit(RunEvent::StageFinished { stage });
      }
    }

    let interrupted = matches!(halt, Some(Halt::Interrupted));
    let abandoned = checkpoint.records.iter_mut().map(Record::revalidate).filter(|&r| r).count();
    if abandoned > 0 {
      debug!("Reverted {abandoned} records abandoned in flight");
    }
    self.persist(&mut checkpoint).await?;

    let summary = RunSummary::from_checkpoint(&checkpoint, interrupted, started.elapsed());
    self.emit(RunEvent::RunFinished(summary.clone()));
    match halt {
      Some(Halt::Fatal(err)) => {
        error!(run_id = %summary.run_id, "Run halted: {err}");
        Err(err)
      },
      Some(Halt::Interrupted) => {
        warn!(run_id = %summary.run_id, "Run interrupted; resume it with the same run id");
        Ok(summary)
      },
      None => {
        info!(
          run_id = %summary.run_id,
          "Run finished: {} done, {} failed, {} skipped, {} unfinished",
          summary.done,
          summary.failed,
          summary.skipped,
          summary.unfinished
        );
        Ok(summary)
      },
    }
  }

  fn force_reset(&self, checkpoint: &mut Checkpoint, stage: Stage) {
    let reset: HashSet<String> = checkpoint
      .records
      .iter_mut()
      .filter_map(|r| r.force_reset(stage).then(|| r.id.clone()))
      .collect();
    checkpoint.manual_queue.retain(|entry| !reset.contains(&entry.id));
    checkpoint.stage_cursor = checkpoint.stage_cursor.min(stage.index());
    info!(run_id = %checkpoint.run_id, "Forced {} records back to {stage}", reset.len());
  }

  /// Records waiting for `stage`, with their ordinal among the records that reached it.
  fn eligible(checkpoint: &Checkpoint, stage: Stage) -> Vec<(usize, usize)> {
    let mut ordinal = 0;
    let mut eligible = Vec::new();
    for (index, record) in checkpoint.records.iter().enumerate() {
      let reached = stage.previous().map_or(true, |prev| record.output(prev).is_some());
      if !reached {
        continue;
      }
      if record.is_ready_for(stage) {
        eligible.push((index, ordinal));
      }
      ordinal += 1;
    }
    eligible
  }

  /// Processes every record waiting for `stage`. Returns `Some` when the run must stop.
  async fn run_stage(
    &self,
    checkpoint: &mut Checkpoint,
    stage: Stage,
    options: &RunOptions,
  ) -> Result<Option<Halt>> {
    let processor = self.processors[&stage].clone();
    let eligible = Self::eligible(checkpoint, stage);
    self.emit(RunEvent::StageStarted { stage, eligible: eligible.len() });
    if eligible.is_empty() {
      debug!(stage = %stage, "Nothing to do");
      return Ok(None);
    }

    let mut queue = eligible.into_iter();
    let mut in_flight = FuturesUnordered::new();
    let mut halt = None;
    loop {
      while halt.is_none() && in_flight.len() < self.concurrency {
        if self.shutdown.is_triggered() {
          info!(stage = %stage, "Shutdown requested; finishing {} records in flight", in_flight.len());
          halt = Some(Halt::Interrupted);
          break;
        }
        let Some((index, ordinal)) = queue.next() else { break };
        let record = &mut checkpoint.records[index];
        record.begin(stage)?;
        let mut working = record.clone();
        let processor = processor.clone();
        let ctx = StageContext {
          run_id: options.run_id.clone(),
          stage,
          ordinal,
          force_acquire: options.force_acquire,
        };
        in_flight.push(async move {
          let result = processor.process(&mut working, &ctx).await;
          (index, working, result)
        });
      }

      // Once halted, keep draining: finished work is applied and saved, never dropped.
      let Some((index, working, result)) = in_flight.next().await else { break };
      match Self::apply(checkpoint, index, stage, working, result) {
        Ok(()) => {
          self.persist(checkpoint).await?;
          let record = &checkpoint.records[index];
          self.emit(RunEvent::RecordFinished {
            stage,
            id: record.id.clone(),
            status: record.status().clone(),
          });
        },
        Err(err) if matches!(halt, Some(Halt::Fatal(_))) => {
          warn!(stage = %stage, "Run-fatal error while draining: {err}");
        },
        Err(err) => halt = Some(Halt::Fatal(err)),
      }
      if !matches!(halt, Some(Halt::Fatal(_))) {
        if let Some(err) = self.threshold_error(checkpoint) {
          halt = Some(Halt::Fatal(err));
        }
      }
    }
    Ok(halt)
  }

  /// Merges a processed record back. Returns an error only when the run must halt.
  fn apply(
    checkpoint: &mut Checkpoint,
    index: usize,
    stage: Stage,
    mut working: Record,
    result: Result<StageOutcome>,
  ) -> Result<()> {
    let outcome = match result {
      Ok(outcome) => outcome,
      Err(SifterError::DataValidation(reason)) => StageOutcome::Skip(reason),
      Err(err) if err.is_run_fatal() => return Err(err),
      Err(err) => StageOutcome::Failure(err.to_string()),
    };

    match outcome {
      StageOutcome::Success(output) => working.complete(stage, output)?,
      StageOutcome::Skip(reason) => {
        debug!(record = %working.id, stage = %stage, "Skipped: {reason}");
        working.skip(stage, reason)?;
      },
      StageOutcome::Failure(reason) => {
        warn!(record = %working.id, stage = %stage, "Failed: {reason}");
        working.fail(stage, reason)?;
      },
      StageOutcome::Unacquirable { providers } => {
        info!(record = %working.id, "Queued for manual acquisition");
        working.fail(stage, EXHAUSTED)?;
        checkpoint.manual_queue.retain(|entry| entry.id != working.id);
        checkpoint.manual_queue.push(ManualQueueEntry {
          id: working.id.clone(),
          title: working.entry.title.clone(),
          doi: working.entry.normalized_doi(),
          providers,
          queued_at: Utc::now(),
        });
      },
    }
    checkpoint.records[index] = working;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;
  use crate::{progress::ProgressTracker, record::Entry};

  /// Decides by title prefix: `fail`, `skip`, `invalid`, `fatal`, `slow` and `manual` each
  /// trigger their outcome, anything else succeeds.
  struct ByTitle {
    stage: Stage,
    calls: AtomicUsize,
  }

  impl ByTitle {
    fn new(stage: Stage) -> Arc<Self> { Arc::new(Self { stage, calls: AtomicUsize::new(0) }) }
  }

  #[async_trait]
  impl StageProcessor for ByTitle {
    fn stage(&self) -> Stage { self.stage }

    async fn process(&self, record: &mut Record, ctx: &StageContext) -> Result<StageOutcome> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let title = record.entry.title.clone();
      Ok(if title.starts_with("fail") {
        StageOutcome::Failure("boom".into())
      } else if title.starts_with("skip") {
        StageOutcome::Skip("excluded".into())
      } else if title.starts_with("fatal") {
        return Err(SifterError::Config("lost credentials".into()));
      } else if title.starts_with("slow") {
        tokio::time::sleep(Duration::from_millis(50)).await;
        StageOutcome::Success(serde_json::json!({ "ordinal": ctx.ordinal }))
      } else if title.starts_with("invalid") {
        return Err(SifterError::DataValidation("bad year".into()));
      } else if title.starts_with("manual") && self.stage == Stage::Analyze {
        StageOutcome::Unacquirable { providers: vec!["a".into(), "b".into()] }
      } else {
        StageOutcome::Success(serde_json::json!({ "ordinal": ctx.ordinal }))
      })
    }
  }

  fn records(titles: &[&str]) -> Vec<Record> {
    titles
      .iter()
      .map(|t| Record::new(Entry { title: t.to_string(), ..Entry::default() }))
      .collect()
  }

  fn scheduler(store: Arc<CheckpointStore>, fraction: f64) -> (StageScheduler, Vec<Arc<ByTitle>>) {
    let processors: Vec<_> = Stage::ALL.iter().map(|&s| ByTitle::new(s)).collect();
    let config = PipelineConfig {
      concurrency: 2,
      fatal_failure_fraction: fraction,
      ..PipelineConfig::default()
    };
    let scheduler = StageScheduler::new(store, &config)
      .with_processors(processors.iter().map(|p| p.clone() as Arc<dyn StageProcessor>));
    (scheduler, processors)
  }

  #[traced_test]
  #[tokio::test]
  async fn runs_every_stage_and_summarizes() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, _) = scheduler(store.clone(), 0.9);
    let tracker = Arc::new(ProgressTracker::default());
    let scheduler = scheduler.with_reporter(tracker.clone());

    let input = records(&["ok 1", "fail 1", "skip 1", "invalid 1", "manual 1", "ok 2"]);
    let summary = scheduler.run(&RunOptions::new("r1"), Some(input)).await.unwrap();

    assert_eq!(summary.total, 6);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.manual_queue, 1);
    assert!(!summary.interrupted);

    let checkpoint = store.load("r1").await.unwrap().unwrap();
    assert_eq!(checkpoint.stage_cursor, 4);
    assert_eq!(checkpoint.manual_queue[0].providers, vec!["a", "b"]);
    let invalid = checkpoint.records.iter().find(|r| r.entry.title == "invalid 1").unwrap();
    assert_eq!(
      invalid.status(),
      &Status::Skipped { stage: Stage::Preprocess, reason: "bad year".into() }
    );
    assert_eq!(tracker.snapshot().stages[&Stage::Report].completed, 2);
    assert!(logs_contain("Queued for manual acquisition"));
  }

  #[tokio::test]
  async fn resume_does_not_reprocess_finished_records() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (first, first_calls) = scheduler(store.clone(), 0.9);
    let options = RunOptions::new("r1").with_stages(vec![Stage::Preprocess, Stage::Screen]);
    first.run(&options, Some(records(&["a", "b", "skip c"]))).await.unwrap();
    assert_eq!(first_calls[0].calls.load(Ordering::SeqCst), 3);

    let (second, calls) = scheduler(store, 0.9);
    let summary = second.run(&RunOptions::new("r1"), None).await.unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(calls[Stage::Preprocess.index()].calls.load(Ordering::SeqCst), 0);
    assert_eq!(calls[Stage::Screen.index()].calls.load(Ordering::SeqCst), 0);
    assert_eq!(calls[Stage::Analyze.index()].calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn duplicate_input_ids_do_not_block_resume() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (first, _) = scheduler(store.clone(), 0.9);
    let options = RunOptions::new("r1").with_stages(vec![Stage::Preprocess]);
    let summary = first.run(&options, Some(records(&["a", "b", "a"]))).await.unwrap();
    assert_eq!(summary.total, 2);

    let (second, _) = scheduler(store, 0.9);
    let summary = second.run(&RunOptions::new("r1"), None).await.unwrap();
    assert_eq!(summary.done, 2);
  }

  #[tokio::test]
  async fn ordinals_count_records_that_reached_the_stage() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, _) = scheduler(store.clone(), 0.9);
    let options =
      RunOptions::new("r1").with_stages(vec![Stage::Preprocess, Stage::Screen, Stage::Analyze]);
    scheduler.run(&options, Some(records(&["a", "skip b", "c"]))).await.unwrap();

    let checkpoint = store.load("r1").await.unwrap().unwrap();
    let ordinals: Vec<_> = checkpoint
      .records
      .iter()
      .filter_map(|r| r.output(Stage::Analyze).map(|o| o["ordinal"].as_u64().unwrap()))
      .collect();
    assert_eq!(ordinals, vec![0, 1]);
  }

  #[tokio::test]
  async fn fatal_threshold_halts_and_checkpoints() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, _) = scheduler(store.clone(), 0.5);
    let titles: Vec<String> =
      (0..10).map(|i| if i < 6 { format!("fail {i}") } else { format!("ok {i}") }).collect();
    let titles: Vec<&str> = titles.iter().map(String::as_str).collect();

    let err = scheduler.run(&RunOptions::new("r1"), Some(records(&titles))).await.unwrap_err();
    assert!(matches!(err, SifterError::FatalThreshold { failed: 6, total: 10, .. }));

    let checkpoint = store.load("r1").await.unwrap().unwrap();
    assert!(checkpoint.records.iter().all(|r| !r.status().is_in_flight()));
    assert_eq!(checkpoint.stage_cursor, 0);
  }

  #[tokio::test]
  async fn fatal_halt_applies_records_already_in_flight() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, calls) = scheduler(store.clone(), 0.9);
    let options = RunOptions::new("r1").with_stages(vec![Stage::Preprocess]);

    let input = records(&["slow a", "fatal b", "c"]);
    let err = scheduler.run(&options, Some(input)).await.unwrap_err();
    assert!(matches!(err, SifterError::Config(_)));
    // `c` was never dispatched: the halt came while `slow a` was still running.
    assert_eq!(calls[Stage::Preprocess.index()].calls.load(Ordering::SeqCst), 2);

    let checkpoint = store.load("r1").await.unwrap().unwrap();
    let status = |title: &str| {
      checkpoint.records.iter().find(|r| r.entry.title == title).unwrap().status().clone()
    };
    assert_eq!(status("slow a"), Status::ready_for(Stage::Screen));
    assert_eq!(status("fatal b"), Status::ready_for(Stage::Preprocess));
    assert_eq!(status("c"), Status::ready_for(Stage::Preprocess));
  }

  #[tokio::test]
  async fn failures_below_the_threshold_complete() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, _) = scheduler(store, 0.5);
    let titles: Vec<String> =
      (0..10).map(|i| if i < 5 { format!("fail {i}") } else { format!("ok {i}") }).collect();
    let titles: Vec<&str> = titles.iter().map(String::as_str).collect();

    let summary = scheduler.run(&RunOptions::new("r1"), Some(records(&titles))).await.unwrap();
    assert_eq!(summary.failed, 5);
    assert_eq!(summary.done, 5);
  }

  #[tokio::test]
  async fn shutdown_stops_before_dispatching() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, calls) = scheduler(store.clone(), 0.5);
    scheduler.shutdown().trigger();

    let summary = scheduler.run(&RunOptions::new("r1"), Some(records(&["a", "b"]))).await.unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.unfinished, 2);
    assert!(calls.iter().all(|p| p.calls.load(Ordering::SeqCst) == 0));
    assert!(store.load("r1").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn force_reruns_from_the_first_selected_stage() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (first, _) = scheduler(store.clone(), 0.9);
    first.run(&RunOptions::new("r1"), Some(records(&["a", "manual b"]))).await.unwrap();

    let (again, calls) = scheduler(store, 0.9);
    let options =
      RunOptions::new("r1").with_stages(vec![Stage::Analyze, Stage::Report]).with_force(true);
    let summary = again.run(&options, None).await.unwrap();
    assert_eq!(calls[Stage::Analyze.index()].calls.load(Ordering::SeqCst), 2);
    assert_eq!(calls[Stage::Screen.index()].calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.done, 1);
    assert_eq!(summary.manual_queue, 1);
  }

  #[tokio::test]
  async fn refuses_unknown_runs_and_missing_processors() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let (scheduler, _) = scheduler(store.clone(), 0.5);
    let err = scheduler.run(&RunOptions::new("nope"), None).await.unwrap_err();
    assert!(matches!(err, SifterError::Config(_)));

    let bare = StageScheduler::new(store, &PipelineConfig::default());
    let err = bare.run(&RunOptions::new("r1"), Some(Vec::new())).await.unwrap_err();
    assert!(err.to_string().contains("no processor"));
  }
}
