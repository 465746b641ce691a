//! Console output.
//!
//! Messages go to stderr with a styled prefix so that stdout stays clean for anything a user may
//! want to pipe. Progress is rendered by [`ConsoleReporter`].

use console::style;
use sifter::{
  progress::{ProgressReporter, ProgressTracker, RunEvent},
  record::Status,
  scheduler::RunSummary,
};

use super::*;

/// Prefix for information messages
pub static INFO_PREFIX: &str = "ℹ ";
/// Prefix for stage headers
pub static WORKING_PREFIX: &str = "» ";
/// Prefix for success messages
pub static SUCCESS_PREFIX: &str = "✓ ";
/// Prefix for error messages
pub static ERROR_PREFIX: &str = "✗ ";
/// Prefix for warning messages
pub static WARNING_PREFIX: &str = "! ";
/// Branch character for tree items
pub static ITEM_PREFIX: &str = "├─";
/// Leaf character for the last tree item
pub static LAST_ITEM_PREFIX: &str = "└─";

/// How often, in finished records, a progress line is printed.
const PROGRESS_EVERY: usize = 10;

/// Prints an information message.
pub fn info(message: impl Display) { eprintln!("{}{message}", style(INFO_PREFIX).blue()) }

/// Prints a success message.
pub fn success(message: impl Display) { eprintln!("{}{message}", style(SUCCESS_PREFIX).green()) }

/// Prints a warning.
pub fn warning(message: impl Display) { eprintln!("{}{message}", style(WARNING_PREFIX).yellow()) }

/// Prints an error.
pub fn failure(message: impl Display) { eprintln!("{}{message}", style(ERROR_PREFIX).red()) }

/// Prints `items` as a tree under the previous line.
pub fn tree<I, D>(items: I)
where
  I: IntoIterator<Item = D>,
  D: Display, {
  let items: Vec<D> = items.into_iter().collect();
  let last = items.len().saturating_sub(1);
  for (i, item) in items.iter().enumerate() {
    let prefix = if i == last { LAST_ITEM_PREFIX } else { ITEM_PREFIX };
    eprintln!("  {} {item}", style(prefix).dim());
  }
}

/// Prints the outcome of a run.
pub fn summary(summary: &RunSummary) {
  let headline = format!(
    "Run {} finished in {:.1}s",
    style(&summary.run_id).bold(),
    summary.elapsed.as_secs_f64()
  );
  if summary.interrupted {
    warning(format!("{headline} (interrupted; rerun with --resume to continue)"));
  } else {
    success(headline);
  }
  counts(summary);
}

/// Prints the state a halted run was checkpointed in.
pub fn halted(summary: &RunSummary) {
  failure(format!(
    "Run {} halted after {:.1}s; the checkpoint below can be resumed",
    style(&summary.run_id).bold(),
    summary.elapsed.as_secs_f64()
  ));
  counts(summary);
}

fn counts(summary: &RunSummary) {
  tree([
    format!("{} done", style(summary.done).green()),
    format!("{} failed", style(summary.failed).red()),
    format!("{} skipped", style(summary.skipped).yellow()),
    format!("{} unfinished", summary.unfinished),
    format!("{} waiting for manual acquisition", summary.manual_queue),
  ]);
}

/// Renders run events as they happen.
#[derive(Default)]
pub struct ConsoleReporter {
  tracker: ProgressTracker,
}

impl ProgressReporter for ConsoleReporter {
  fn on_event(&self, event: &RunEvent) {
    self.tracker.on_event(event);
    match event {
      RunEvent::RunStarted { run_id, records, resumed } => info(format!(
        "{} run {} with {records} records",
        if *resumed { "Resuming" } else { "Starting" },
        style(run_id).bold()
      )),
      RunEvent::StageStarted { stage, eligible } => eprintln!(
        "{}{} {eligible} records",
        style(WORKING_PREFIX).cyan(),
        style(stage).bold()
      ),
      RunEvent::RecordFinished { stage, id, status } => {
        if let Status::Failed { reason, .. } = status {
          warning(format!("{id} failed at {stage}: {reason}"));
        }
        let snapshot = self.tracker.snapshot();
        let Some(progress) = snapshot.stages.get(stage) else { return };
        let finished = progress.finished();
        if finished % PROGRESS_EVERY == 0 || finished == progress.eligible {
          let eta = snapshot.eta.map(|d| format!(", about {}s left", d.as_secs())).unwrap_or_default();
          eprintln!("  {} {finished}/{}{eta}", style(stage).dim(), progress.eligible);
        }
      },
      RunEvent::StageFinished { .. } | RunEvent::RunFinished(_) => {},
    }
  }
}
