//! Validation and cleanup of ingested entries.

use chrono::Datelike;
use serde_json::json;

use super::*;
use crate::{
  record::{normalize_doi, Record},
  stage::{StageContext, StageOutcome},
};

/// Oldest publication year accepted.
pub const MIN_YEAR: i32 = 1800;

/// Cleans whitespace, checks the title and year, and normalizes the DOI.
///
/// Entries without a title or a plausible year fail with
/// [`SifterError::DataValidation`], which the scheduler turns into a skip.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreprocessProcessor;

fn squash(text: &str) -> String { text.split_whitespace().collect::<Vec<_>>().join(" ") }

#[async_trait]
impl StageProcessor for PreprocessProcessor {
  fn stage(&self) -> Stage { Stage::Preprocess }

  async fn process(&self, record: &mut Record, _ctx: &StageContext) -> Result<StageOutcome> {
    let entry = &mut record.entry;
    entry.title = squash(&entry.title);
    if entry.title.is_empty() {
      return Err(SifterError::DataValidation("missing title".into()));
    }

    let latest = Utc::now().year() + 1;
    match entry.year {
      None => return Err(SifterError::DataValidation("missing or non-numeric year".into())),
      Some(year) if !(MIN_YEAR..=latest).contains(&year) =>
        return Err(SifterError::DataValidation(format!("implausible year {year}"))),
      Some(_) => {},
    }

    entry.authors = entry.authors.iter().map(|a| squash(a)).filter(|a| !a.is_empty()).collect();
    if let Some(text) = entry.abstract_text.as_deref() {
      entry.abstract_text = Some(squash(text)).filter(|t| !t.is_empty());
    }

    let doi = match entry.doi.as_deref() {
      Some(raw) => {
        let doi = normalize_doi(raw);
        if doi.is_none() {
          warn!(record = %record.id, "Ignoring malformed DOI '{raw}'");
        }
        doi
      },
      None => None,
    };

    Ok(StageOutcome::Success(json!({
      "title": entry.title,
      "authors": entry.authors,
      "year": entry.year,
      "doi": doi,
      "journal": entry.journal,
      "has_abstract": entry.abstract_text().is_some(),
    })))
  }
}
