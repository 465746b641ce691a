//! Command line driver for the `sifter` literature pipeline.
//!
//! ```bash
//! # Start a run over a Web of Science export
//! sifter run --input savedrecs.json --batch-size 200
//!
//! # Continue the most recent run after an interruption
//! sifter run --resume
//!
//! # Re-run screening and analysis of an existing run
//! sifter run --run-id 20240131-154502 --stages screen,analyze --force
//!
//! # Inspect a run and its manual acquisition queue
//! sifter status
//! sifter queue --run-id 20240131-154502
//! ```
//!
//! Exit codes: `0` on success (including a clean stop after Ctrl-C), `1` when the run halted,
//! `2` for configuration errors.

#![warn(missing_docs)]

use std::{fmt::Display, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{builder::ArgAction, Parser};
use console::style;
use sifter::{checkpoint::CheckpointStore, config::Config, error::SifterError};
use tracing::{debug, info, trace};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod commands;
pub mod error;
pub mod interaction;

use crate::{commands::*, error::*, interaction::*};

/// File name of the persistent log inside the state directory's `logs` folder.
const LOG_FILE: &str = "sifter.log";

/// Command line interface configuration and argument parsing
#[derive(Parser)]
#[command(author, version, about = "Resumable literature screening pipeline")]
pub struct Cli {
  /// Verbose mode (-v, -vv, -vvv) for different levels of logging detail
  #[arg(short, long, action = ArgAction::Count, global = true, help = "Increase logging verbosity")]
  verbose: u8,

  /// Configuration file. Defaults to the platform config directory.
  #[arg(long, short, global = true)]
  config: Option<PathBuf>,

  /// Directory holding checkpoints, logs and the audit database. Overrides the configuration.
  #[arg(long, global = true)]
  state_dir: Option<PathBuf>,

  /// The subcommand to execute
  #[command(subcommand)]
  command: Commands,
}

impl Cli {
  /// Loads the configuration named on the command line, or the default one.
  fn load_config(&self) -> Result<Config> {
    let path = self.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&path)
      .map_err(|e| SifterCliError::Config(format!("{}: {e}", path.display())))?;
    if let Some(dir) = &self.state_dir {
      config = config.with_state_dir(dir);
    }
    Ok(config)
  }
}

/// Configures logging to stderr and, when `log_dir` is given, to `<log_dir>/sifter.log`.
///
/// The verbosity levels are:
/// - 0: error (default)
/// - 1: warn
/// - 2: info
/// - 3: debug
/// - 4+: trace
///
/// `RUST_LOG` takes precedence over the flag. The returned guard flushes the file writer and must
/// live until the process exits.
fn setup_logging(verbosity: u8, log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
  let filter = match verbosity {
    0 => "error",
    1 => "warn",
    2 => "info",
    3 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(true);
  let (file, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
    Some(dir) => {
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true);
      (Some(layer), Some(guard))
    },
    None => (None, None),
  };

  let _ = tracing_subscriber::registry().with(filter).with(stderr).with(file).try_init();
  guard
}

/// Entry point: parses arguments, sets up logging, and runs the requested command.
#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();

  let config = match cli.load_config() {
    Ok(config) => config,
    Err(e) => {
      setup_logging(cli.verbose, None);
      failure(&e);
      return ExitCode::from(e.exit_code());
    },
  };
  let _guard = setup_logging(cli.verbose, Some(config.log_dir()));
  trace!("Using state directory {}", config.state_dir.display());

  let result = match &cli.command {
    Commands::Run(args) => run(&config, args).await,
    Commands::Status { run_id } => status(&config, run_id.as_deref()).await,
    Commands::Queue { run_id } => queue(&config, run_id.as_deref()).await,
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      failure(&e);
      ExitCode::from(e.exit_code())
    },
  }
}
