//! Relevance screening.

use super::*;
use crate::{
  llm::ChatRequest,
  prompts::{render, SCREEN_SYSTEM, SCREEN_USER},
  record::Record,
  stage::{StageContext, StageOutcome},
};

/// Asks the model whether a record meets the inclusion criteria.
///
/// Records without an abstract are screened out without a model call. An `accept` verdict
/// becomes the stage output, a `reject` verdict a skip. Replies without a usable verdict are
/// per-record failures.
pub struct ScreenProcessor {
  llm:      Arc<dyn LanguageModel>,
  topic:    String,
  criteria: String,
}

impl ScreenProcessor {
  /// Creates a screener using the topic and criteria in `config`.
  pub fn new(llm: Arc<dyn LanguageModel>, config: &PipelineConfig) -> Self {
    Self { llm, topic: config.topic.clone(), criteria: config.criteria.clone() }
  }
}

#[async_trait]
impl StageProcessor for ScreenProcessor {
  fn stage(&self) -> Stage { Stage::Screen }

  async fn process(&self, record: &mut Record, _ctx: &StageContext) -> Result<StageOutcome> {
    let Some(abstract_text) = record.entry.abstract_text() else {
      return Ok(StageOutcome::Skip("screened out: no abstract".into()));
    };

    let request = ChatRequest::new("screen")
      .with_system(render(SCREEN_SYSTEM, &[("topic", self.topic.as_str())]))
      .with_message(render(SCREEN_USER, &[
        ("criteria", self.criteria.as_str()),
        ("title", record.entry.title.as_str()),
        ("abstract", abstract_text),
      ]))
      .with_temperature(0.0);
    let verdict = self.llm.complete_json(request).await?;

    let decision = verdict.get("decision").and_then(Value::as_str).map(str::to_ascii_lowercase);
    let reason = verdict.get("reason").and_then(Value::as_str).unwrap_or("no reason given");
    Ok(match decision.as_deref() {
      Some("accept" | "include") => StageOutcome::Success(verdict.clone()),
      Some("reject" | "exclude") => StageOutcome::Skip(format!("screened out: {reason}")),
      other => StageOutcome::Failure(format!("unusable screening decision {other:?}")),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{record::Entry, stages::tests::CannedModel};

  fn record(abstract_text: Option<&str>) -> Record {
    Record::new(Entry {
      title: "Deep soil carbon".into(),
      year: Some(2021),
      abstract_text: abstract_text.map(Into::into),
      ..Entry::default()
    })
  }

  fn ctx() -> StageContext {
    StageContext { run_id: "r".into(), stage: Stage::Screen, ordinal: 0, force_acquire: false }
  }

  fn config() -> PipelineConfig {
    PipelineConfig {
      topic: "soil carbon".into(),
      criteria: "reports measured stocks".into(),
      ..PipelineConfig::default()
    }
  }

  #[tokio::test]
  async fn accepts_and_rejects() {
    let llm = CannedModel::new(vec![
      r#"{"decision": "accept", "reason": "measured stocks", "confidence": 0.9}"#,
      "```json\n{\"decision\": \"Reject\", \"reason\": \"modelling only\"}\n```",
    ]);
    let screen = ScreenProcessor::new(llm.clone(), &config());

    let outcome = screen.process(&mut record(Some("We measured...")), &ctx()).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Success(v) if v["confidence"] == 0.9));

    let outcome = screen.process(&mut record(Some("We modelled...")), &ctx()).await.unwrap();
    assert_eq!(outcome, StageOutcome::Skip("screened out: modelling only".into()));

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].json_mode);
    assert!(requests[0].messages[0].content.contains("soil carbon"));
    assert!(requests[0].messages[1].content.contains("reports measured stocks"));
  }

  #[tokio::test]
  async fn missing_abstract_skips_without_a_call() {
    let llm = CannedModel::new(vec![]);
    let screen = ScreenProcessor::new(llm.clone(), &config());
    let outcome = screen.process(&mut record(None), &ctx()).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Skip(_)));
    assert!(llm.requests().is_empty());
  }

  #[tokio::test]
  async fn unusable_replies_fail_the_record() {
    let screen = ScreenProcessor::new(CannedModel::new(vec![r#"{"verdict": "yes"}"#]), &config());
    let outcome = screen.process(&mut record(Some("text")), &ctx()).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Failure(_)));

    let screen = ScreenProcessor::new(CannedModel::new(vec!["I cannot help"]), &config());
    let err = screen.process(&mut record(Some("text")), &ctx()).await.unwrap_err();
    assert!(!err.is_run_fatal());
  }
}
