//! `sifter status`: record counts of a run.

use super::*;

/// Prints the counts of `run_id`, or of the latest run.
///
/// The checkpoint is only read. An unreadable one is reported and left where it is.
pub async fn status(config: &Config, run_id: Option<&str>) -> Result<()> {
  let store = CheckpointStore::new(config.runs_dir());
  let Some(run_id) = resolve_run(&store, run_id).await? else {
    info("No runs found");
    return Ok(());
  };
  let Some(checkpoint) = store.inspect(&run_id).await? else {
    return Err(SifterError::NotFound(format!("run '{run_id}'")).into());
  };

  info(format!(
    "Run {} ({} records, updated {})",
    style(&checkpoint.run_id).bold(),
    checkpoint.records.len(),
    checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
  ));
  tree(
    checkpoint.terminal_counts().into_iter().map(|(label, count)| format!("{label}: {count}")),
  );
  eprintln!("{}", style("By status").dim());
  tree(checkpoint.counts().into_iter().map(|(label, count)| format!("{label}: {count}")));

  let stages_done = checkpoint.stage_cursor;
  eprintln!(
    "{}",
    style(format!("{stages_done} stage(s) dispatched, {} in manual queue", checkpoint.manual_queue.len())).dim()
  );
  Ok(())
}
