//! Assembly of per-record report entries.

use serde_json::json;

use super::*;
use crate::{
  record::Record,
  stage::{StageContext, StageOutcome},
};

/// Collects the entry metadata and the outputs of earlier stages into one report entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportProcessor;

#[async_trait]
impl StageProcessor for ReportProcessor {
  fn stage(&self) -> Stage { Stage::Report }

  async fn process(&self, record: &mut Record, _ctx: &StageContext) -> Result<StageOutcome> {
    let entry = &record.entry;
    let artifact = record.artifact.as_ref().map(|a| {
      json!({ "provider": a.provider, "path": a.path, "sha256": a.sha256, "bytes": a.bytes })
    });
    Ok(StageOutcome::Success(json!({
      "id": record.id,
      "title": entry.title,
      "authors": entry.authors,
      "year": entry.year,
      "doi": entry.normalized_doi(),
      "journal": entry.journal,
      "url": entry.url,
      "screening": record.output(Stage::Screen),
      "analysis": record.output(Stage::Analyze),
      "artifact": artifact,
    })))
  }
}
