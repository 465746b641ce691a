//! `sifter run`: start or resume a run.
//!
//! Besides the checkpoint, each run directory receives two files after every invocation:
//! `report.json` with the report entries of finished records and `manual_queue.json` with the
//! records that need a human to find their full text. Both are rewritten even when the run
//! halted, so they always describe the last checkpoint. A run that selected the report stage and
//! finished also gets `report.md`, the run report of [`RunReport`].
//!
//! When the run halts, the counts of the saved checkpoint are printed before the error.

use sifter::{
  audit::AuditLog,
  chain::AcquisitionChain,
  checkpoint::{validate_run_id, Checkpoint},
  client::RateLimitedClient,
  ingest,
  llm::{ChatClient, LanguageModel},
  progress::LogReporter,
  record::Status,
  scheduler::{RunOptions, RunSummary, Shutdown, StageScheduler},
  stage::Stage,
  stages,
  synthesis::RunReport,
};

use super::*;

/// File name of the report written next to the checkpoint.
pub const REPORT_FILE: &str = "report.json";

/// File name of the manual queue export written next to the checkpoint.
pub const MANUAL_QUEUE_FILE: &str = "manual_queue.json";

/// File name of the run report written next to the checkpoint.
pub const RUN_REPORT_FILE: &str = "report.md";

/// Runs the pipeline as described by `args`.
pub async fn run(config: &Config, args: &RunArgs) -> Result<()> {
  let started = std::time::Instant::now();
  let store = Arc::new(CheckpointStore::new(config.runs_dir()));
  let selected = Stage::parse_list(&args.stages)?;

  let run_id = match (&args.run_id, args.resume) {
    (Some(id), _) => id.clone(),
    (None, true) => store
      .latest()
      .await?
      .ok_or_else(|| SifterCliError::Config("--resume given but there are no runs to resume".into()))?,
    (None, false) => RunOptions::fresh_run_id(),
  };
  validate_run_id(&run_id)?;

  let input = match &args.input {
    Some(path) => Some(ingest::load(path, args.batch_size).await?),
    None => None,
  };

  let audit = AuditLog::open(config.audit_path()).await?;
  let client = Arc::new(RateLimitedClient::new(&config.rate_limit).with_audit(audit));

  // The run report uses a model when one is configured and falls back to statistics otherwise.
  let llm: Option<Arc<dyn LanguageModel>> = match ChatClient::new(&config.llm, Arc::clone(&client)) {
    Ok(model) => Some(Arc::new(model) as Arc<dyn LanguageModel>),
    Err(e) if selected.iter().any(|s| s.needs_llm()) => return Err(e.into()),
    Err(e) => {
      debug!("Running without a language model: {e}");
      None
    },
  };
  let chain = if config.pipeline.deep_analysis && selected.contains(&Stage::Analyze) {
    Some(Arc::new(AcquisitionChain::from_config(config, Arc::clone(&client))?))
  } else {
    None
  };
  let processors = stages::build(&selected, &config.pipeline, llm.clone(), chain)?;

  let shutdown = Shutdown::default();
  let signal = shutdown.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warning("Interrupt received; finishing records in flight");
      signal.trigger();
    }
  });

  let scheduler = StageScheduler::new(Arc::clone(&store), &config.pipeline)
    .with_processors(processors)
    .with_reporter(Arc::new(LogReporter))
    .with_reporter(Arc::new(ConsoleReporter::default()))
    .with_shutdown(shutdown);

  let options = RunOptions::new(&run_id)
    .with_stages(selected.clone())
    .with_force(args.force)
    .with_force_acquire(args.force_acquire);
  debug!(?options, "Starting run");
  let result = scheduler.run(&options, input).await;

  let checkpoint = store.inspect(&run_id).await?;
  if let Some(checkpoint) = &checkpoint {
    let run_dir = store.run_dir(&run_id);
    export(&run_dir, checkpoint).await?;
    if result.is_ok() && selected.contains(&Stage::Report) {
      let report = RunReport::generate(checkpoint, &config.pipeline.topic, llm.as_deref()).await;
      tokio::fs::write(run_dir.join(RUN_REPORT_FILE), report.to_markdown()).await?;
      if report.is_fallback() {
        warning("The run report contains statistics only; see the log for why");
      }
    }
  }

  let lost = client.audit_failures();
  if lost > 0 {
    warning(format!(
      "{lost} call attempts could not be written to the audit log at {}",
      config.audit_path().display()
    ));
  }

  match result {
    Ok(summary) => {
      interaction::summary(&summary);
      Ok(())
    },
    Err(err) => {
      let checkpoint = checkpoint.filter(|_| !matches!(err, SifterError::Config(_)));
      if let Some(checkpoint) = &checkpoint {
        interaction::halted(&RunSummary::from_checkpoint(checkpoint, false, started.elapsed()));
      }
      Err(err.into())
    },
  }
}

/// Writes `report.json` and `manual_queue.json` into `run_dir`.
async fn export(run_dir: &std::path::Path, checkpoint: &Checkpoint) -> Result<()> {
  let report: Vec<_> = checkpoint
    .records
    .iter()
    .filter(|record| matches!(record.status(), Status::Done))
    .filter_map(|record| record.output(Stage::Report))
    .collect();
  tokio::fs::write(run_dir.join(REPORT_FILE), serde_json::to_vec_pretty(&report)?).await?;
  tokio::fs::write(
    run_dir.join(MANUAL_QUEUE_FILE),
    serde_json::to_vec_pretty(&checkpoint.manual_queue)?,
  )
  .await?;
  info!("Wrote {} report entries to {}", report.len(), run_dir.display());
  Ok(())
}
