//! Loading bibliographic entries into records.
//!
//! Input is either a JSON array of entries or JSON Lines (one entry per line). Field names follow
//! [`Entry`]; anything else is kept in [`Entry::extra`].

use std::collections::HashSet;

use super::*;
use crate::record::{Entry, Record};

/// Parses entries from JSON or JSON Lines text.
pub fn parse_entries(content: &str) -> Result<Vec<Entry>> {
  let trimmed = content.trim_start();
  if trimmed.is_empty() {
    return Ok(Vec::new());
  }
  if trimmed.starts_with('[') {
    return Ok(serde_json::from_str(trimmed)?);
  }
  content
    .lines()
    .enumerate()
    .filter(|(_, line)| !line.trim().is_empty())
    .map(|(n, line)| {
      serde_json::from_str(line).map_err(|e| {
        SifterError::DataValidation(format!("line {}: {e}", n + 1))
      })
    })
    .collect()
}

/// Turns entries into records.
///
/// Duplicates (same derived id) keep their first occurrence. The batch is ordered newest first,
/// entries without a year last, and then capped at `batch_size` when given.
pub fn into_records(entries: Vec<Entry>, batch_size: Option<usize>) -> Vec<Record> {
  let mut seen = HashSet::new();
  let mut records: Vec<Record> = entries
    .into_iter()
    .map(Record::new)
    .filter(|record| {
      let fresh = seen.insert(record.id.clone());
      if !fresh {
        debug!("Dropping duplicate entry {}", record.id);
      }
      fresh
    })
    .collect();

  records.sort_by_key(|record| std::cmp::Reverse(record.entry.year.unwrap_or(i32::MIN)));
  if let Some(size) = batch_size {
    records.truncate(size);
  }
  records
}

/// Reads `path` and returns the records of a new run.
pub async fn load(path: impl AsRef<Path>, batch_size: Option<usize>) -> Result<Vec<Record>> {
  let path = path.as_ref();
  let content = tokio::fs::read_to_string(path).await.map_err(|e| {
    SifterError::Config(format!("cannot read input {}: {e}", path.display()))
  })?;
  let entries = parse_entries(&content)?;
  let total = entries.len();
  let records = into_records(entries, batch_size);
  info!("Loaded {} records from {} ({} entries)", records.len(), path.display(), total);
  Ok(records)
}
