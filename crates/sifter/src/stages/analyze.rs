//! Summary and data extraction, optionally from the full text.
//!
//! Every record gets an abstract-level analysis. With deep analysis enabled, the first
//! `analyze_top` records still in the pipeline also go through the [`AcquisitionChain`]; when a
//! PDF is acquired its first pages are read and sent for a second, full-text analysis. A record
//! whose full text cannot be acquired is reported as
//! [`StageOutcome::Unacquirable`] so the scheduler can queue it for a human.

use serde_json::json;

use super::*;
use crate::{
  chain::AcquisitionResult,
  llm::ChatRequest,
  pdf,
  prompts::{render, truncate, ANALYZE_SYSTEM, ANALYZE_USER, DEEP_ANALYZE_USER, DEEP_TEXT_LIMIT},
  record::Record,
  stage::{StageContext, StageOutcome},
};

/// The analyze stage.
pub struct AnalyzeProcessor {
  llm:       Arc<dyn LanguageModel>,
  topic:     String,
  deep:      bool,
  max_pages: usize,
  top:       usize,
  chain:     Option<Arc<AcquisitionChain>>,
}

impl AnalyzeProcessor {
  /// Creates the processor. Deep analysis additionally needs [`with_chain`](Self::with_chain).
  pub fn new(llm: Arc<dyn LanguageModel>, config: &PipelineConfig) -> Self {
    Self {
      llm,
      topic: config.topic.clone(),
      deep: config.deep_analysis,
      max_pages: config.deep_max_pages,
      top: config.analyze_top,
      chain: None,
    }
  }

  /// Uses `chain` to acquire full texts.
  pub fn with_chain(mut self, chain: Arc<AcquisitionChain>) -> Self {
    self.chain = Some(chain);
    self
  }

  fn system(&self) -> String { render(ANALYZE_SYSTEM, &[("topic", self.topic.as_str())]) }

  async fn summarize(&self, record: &Record) -> Result<Value> {
    let request = ChatRequest::new("analyze").with_system(self.system()).with_message(render(
      ANALYZE_USER,
      &[
        ("title", record.entry.title.as_str()),
        ("abstract", record.entry.abstract_text().unwrap_or("(no abstract available)")),
      ],
    ));
    self.llm.complete_json(request).await
  }

  async fn deep_analysis(&self, record: &Record, path: &Path) -> Result<Value> {
    let content = pdf::extract(path, self.max_pages).await?;
    let text = content.text();
    if text.trim().is_empty() {
      warn!(record = %record.id, "No extractable text in {}", path.display());
      return Ok(json!({ "pages_read": content.pages.len(), "result": null }));
    }

    let request = ChatRequest::new("deep_analyze").with_system(self.system()).with_message(render(
      DEEP_ANALYZE_USER,
      &[
        ("topic", self.topic.as_str()),
        ("title", record.entry.title.as_str()),
        ("text", truncate(&text, DEEP_TEXT_LIMIT)),
      ],
    ));
    let result = self.llm.complete_json(request).await?;
    Ok(json!({
      "pages_read": content.pages.len(),
      "total_pages": content.total_pages,
      "pdf_title": content.metadata.title,
      "result": result,
    }))
  }
}

#[async_trait]
impl StageProcessor for AnalyzeProcessor {
  fn stage(&self) -> Stage { Stage::Analyze }

  async fn process(&self, record: &mut Record, ctx: &StageContext) -> Result<StageOutcome> {
    let summary = self.summarize(record).await?;

    let chain = match &self.chain {
      Some(chain) if self.deep && ctx.ordinal < self.top => chain,
      _ => return Ok(StageOutcome::Success(json!({ "summary": summary }))),
    };

    let artifact = match chain.acquire(record, &ctx.run_id, ctx.force_acquire).await {
      AcquisitionResult::Acquired(artifact) => artifact,
      AcquisitionResult::Exhausted { providers } =>
        return Ok(StageOutcome::Unacquirable { providers }),
    };
    record.mark_acquired(Stage::Analyze)?;

    let deep = self.deep_analysis(record, &artifact.path).await?;
    Ok(StageOutcome::Success(json!({
      "summary": summary,
      "full_text": deep,
      "artifact": { "provider": artifact.provider, "sha256": artifact.sha256 },
    })))
  }
}
