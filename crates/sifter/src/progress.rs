//! Observing a run.
//!
//! The scheduler emits a [`RunEvent`] at every step worth reporting. Reporters only observe:
//! they never touch records or checkpoints, and a slow or failing reporter cannot affect the run.
//!
//! # Examples
//!
//! ```
//! use sifter::{
//!   progress::{ProgressReporter, ProgressTracker, RunEvent},
//!   stage::Stage,
//! };
//!
//! let tracker = ProgressTracker::default();
//! tracker.on_event(&RunEvent::StageStarted { stage: Stage::Screen, eligible: 2 });
//! let snapshot = tracker.snapshot();
//! assert_eq!(snapshot.stage, Some(Stage::Screen));
//! assert_eq!(snapshot.remaining(), 2);
//! ```

use std::{
  sync::Mutex,
  time::{Duration, Instant},
};

use super::*;
use crate::{record::Status, scheduler::RunSummary, stage::Stage};

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
  /// The working set is loaded and processing is about to start.
  RunStarted {
    /// Run identifier.
    run_id:  String,
    /// Records in the run.
    records: usize,
    /// Whether the run continues from a checkpoint.
    resumed: bool,
  },
  /// A stage is about to be dispatched.
  StageStarted {
    /// The stage.
    stage:    Stage,
    /// Records waiting for it.
    eligible: usize,
  },
  /// A record left a stage.
  RecordFinished {
    /// The stage.
    stage:  Stage,
    /// Record id.
    id:     String,
    /// Status after the stage.
    status: Status,
  },
  /// Every eligible record went through the stage.
  StageFinished {
    /// The stage.
    stage: Stage,
  },
  /// The run stopped, normally or not.
  RunFinished(RunSummary),
}

/// Receives run events. Called from the scheduler task, one event at a time.
pub trait ProgressReporter: Send + Sync {
  /// Handles one event. The default ignores it.
  fn on_event(&self, event: &RunEvent) { let _ = event; }
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
  fn on_event(&self, event: &RunEvent) {
    match event {
      RunEvent::RunStarted { run_id, records, resumed } =>
        info!(run_id = %run_id, records, resumed, "Run started"),
      RunEvent::StageStarted { stage, eligible } =>
        info!(stage = %stage, eligible, "Stage started"),
      RunEvent::RecordFinished { stage, id, status } =>
        debug!(stage = %stage, record = %id, "Record is now {status}"),
      RunEvent::StageFinished { stage } => info!(stage = %stage, "Stage finished"),
      RunEvent::RunFinished(summary) => info!(
        run_id = %summary.run_id,
        done = summary.done,
        failed = summary.failed,
        skipped = summary.skipped,
        unfinished = summary.unfinished,
        "Run finished"
      ),
    }
  }
}

/// Per-stage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProgress {
  /// Records that were eligible when the stage started.
  pub eligible:  usize,
  /// Records that moved on to the next stage or finished.
  pub completed: usize,
  /// Records that failed.
  pub failed:    usize,
  /// Records that were skipped.
  pub skipped:   usize,
}

impl StageProgress {
  /// Records that left the stage.
  pub fn finished(&self) -> usize { self.completed + self.failed + self.skipped }
}

/// Point-in-time view of a [`ProgressTracker`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
  /// Stage currently being dispatched.
  pub stage:  Option<Stage>,
  /// Counters of every stage seen so far.
  pub stages: BTreeMap<Stage, StageProgress>,
  /// Estimated time until the current stage is done.
  pub eta:    Option<Duration>,
}

impl ProgressSnapshot {
  /// Records of the current stage that have not finished yet.
  pub fn remaining(&self) -> usize {
    self
      .stage
      .and_then(|stage| self.stages.get(&stage))
      .map_or(0, |p| p.eligible.saturating_sub(p.finished()))
  }
}

#[derive(Debug, Default)]
struct TrackerState {
  stage:         Option<Stage>,
  stage_started: Option<Instant>,
  stages:        BTreeMap<Stage, StageProgress>,
}

/// Counts records per stage and estimates the remaining time of the current stage from the
/// mean time per finished record.
#[derive(Debug, Default)]
pub struct ProgressTracker {
  state: Mutex<TrackerState>,
}

impl ProgressTracker {
  /// Current counters and ETA.
  pub fn snapshot(&self) -> ProgressSnapshot {
    let state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    let eta = state.stage.and_then(|stage| {
      let progress = state.stages.get(&stage)?;
      let finished = progress.finished();
      if finished == 0 {
        return None;
      }
      let elapsed = state.stage_started?.elapsed();
      let remaining = progress.eligible.saturating_sub(finished) as u32;
      Some(elapsed / finished as u32 * remaining)
    });
    ProgressSnapshot { stage: state.stage, stages: state.stages.clone(), eta }
  }
}

impl ProgressReporter for ProgressTracker {
  fn on_event(&self, event: &RunEvent) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    match event {
      RunEvent::StageStarted { stage, eligible } => {
        state.stage = Some(*stage);
        state.stage_started = Some(Instant::now());
        state.stages.insert(*stage, StageProgress { eligible: *eligible, ..Default::default() });
      },
      RunEvent::RecordFinished { stage, status, .. } => {
        let progress = state.stages.entry(*stage).or_default();
        match status {
          Status::Failed { .. } => progress.failed += 1,
          Status::Skipped { .. } => progress.skipped += 1,
          _ => progress.completed += 1,
        }
      },
      RunEvent::RunFinished(_) => state.stage = None,
      RunEvent::RunStarted { .. } | RunEvent::StageFinished { .. } => {},
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn finished(stage: Stage, id: &str, status: Status) -> RunEvent {
    RunEvent::RecordFinished { stage, id: id.into(), status }
  }

  #[test]
  fn tracker_counts_per_stage() {
    let tracker = ProgressTracker::default();
    tracker.on_event(&RunEvent::StageStarted { stage: Stage::Screen, eligible: 3 });
    tracker.on_event(&finished(Stage::Screen, "a", Status::StageComplete { stage: Stage::Screen }));
    tracker.on_event(&finished(
      Stage::Screen,
      "b",
      Status::Skipped { stage: Stage::Screen, reason: "screened out".into() },
    ));

    let snapshot = tracker.snapshot();
    let screen = snapshot.stages[&Stage::Screen];
    assert_eq!(screen.completed, 1);
    assert_eq!(screen.skipped, 1);
    assert_eq!(snapshot.remaining(), 1);
    assert!(snapshot.eta.is_some());
  }

  #[test]
  fn no_eta_before_first_record() {
    let tracker = ProgressTracker::default();
    assert_eq!(tracker.snapshot().eta, None);
    tracker.on_event(&RunEvent::StageStarted { stage: Stage::Analyze, eligible: 5 });
    assert_eq!(tracker.snapshot().eta, None);
  }

  #[traced_test]
  #[test]
  fn log_reporter_writes_events() {
    LogReporter.on_event(&RunEvent::StageStarted { stage: Stage::Report, eligible: 7 });
    assert!(logs_contain("Stage started"));
    NoopReporter.on_event(&RunEvent::StageFinished { stage: Stage::Report });
  }
}
