//! Subcommands.

use clap::{Args, Subcommand};

use super::*;

pub mod queue;
pub mod run;
pub mod status;

pub use queue::queue;
pub use run::run;
pub use status::status;

/// Available commands for the CLI
#[derive(Subcommand, Clone)]
pub enum Commands {
  /// Start a new run or resume an existing one
  Run(RunArgs),

  /// Show record counts of a run
  Status {
    /// Run to inspect. Defaults to the most recently updated run.
    #[arg(long)]
    run_id: Option<String>,
  },

  /// List records waiting for manual full-text acquisition
  Queue {
    /// Run to inspect. Defaults to the most recently updated run.
    #[arg(long)]
    run_id: Option<String>,
  },
}

/// Options of `sifter run`.
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
  /// Run identifier. A new one is generated when neither this nor `--resume` is given.
  #[arg(long)]
  pub run_id: Option<String>,

  /// Resume the most recently updated run
  #[arg(long, conflicts_with = "run_id")]
  pub resume: bool,

  /// Bibliographic entries (JSON array or JSON Lines). Required for a new run.
  #[arg(long, short)]
  pub input: Option<PathBuf>,

  /// Keep only the newest N entries of the input
  #[arg(long)]
  pub batch_size: Option<usize>,

  /// Comma separated stages to run
  #[arg(long, default_value = "preprocess,screen,analyze,report")]
  pub stages: String,

  /// Re-process the selected stages even where they already completed
  #[arg(long)]
  pub force: bool,

  /// Retry providers whose outcome for a record was already final
  #[arg(long)]
  pub force_acquire: bool,
}

/// Picks the run named by `run_id`, or the latest one.
async fn resolve_run(store: &CheckpointStore, run_id: Option<&str>) -> Result<Option<String>> {
  match run_id {
    Some(id) => {
      sifter::checkpoint::validate_run_id(id)?;
      Ok(Some(id.to_string()))
    },
    None => Ok(store.latest().await?),
  }
}
