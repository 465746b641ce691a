//! `sifter queue`: records waiting for manual acquisition.

use super::*;

/// Lists the manual queue of `run_id`, or of the latest run.
///
/// Entries go to stdout, one per line, so the list can be piped elsewhere. A full text dropped
/// into the manual directory under the record id (or its DOI with `/` replaced by `_`) is picked
/// up by the next `sifter run --resume --stages analyze,report --force --force-acquire`.
pub async fn queue(config: &Config, run_id: Option<&str>) -> Result<()> {
  let store = CheckpointStore::new(config.runs_dir());
  let Some(run_id) = resolve_run(&store, run_id).await? else {
    info("No runs found");
    return Ok(());
  };
  let Some(checkpoint) = store.inspect(&run_id).await? else {
    return Err(SifterError::NotFound(format!("run '{run_id}'")).into());
  };

  if checkpoint.manual_queue.is_empty() {
    success(format!("Nothing waiting for manual acquisition in run {run_id}"));
    return Ok(());
  }
  info(format!(
    "{} records waiting for manual acquisition; drop PDFs into {}",
    checkpoint.manual_queue.len(),
    config.manual_dir().display()
  ));
  for entry in &checkpoint.manual_queue {
    println!(
      "{}\t{}\t{}\t{}",
      entry.id,
      entry.doi.as_deref().unwrap_or("-"),
      entry.title,
      entry.providers.join(",")
    );
  }
  Ok(())
}
