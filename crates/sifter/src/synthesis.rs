//! The run report: statistics over a checkpoint plus a model-written narrative.
//!
//! The per-record entries of the report stage say what was found in each paper. The run report
//! says what the run found as a whole. [`RunReport::generate`] always produces a report: when no
//! model is available, or the model call fails, the narrative is left out and the rendered
//! Markdown says that only the statistics could be produced.

use super::*;
use crate::{
  checkpoint::Checkpoint,
  llm::{ChatRequest, LanguageModel},
  prompts::{render, truncate, REPORT_SUMMARY_CHARS, REPORT_SUMMARY_LIMIT, REPORT_SYSTEM, REPORT_USER},
  record::Record,
  stage::Stage,
};

/// Counts over the records of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatistics {
  /// Records in the run.
  pub total:              usize,
  /// Records the screening stage accepted.
  pub passed_screening:   usize,
  /// Records with an analysis.
  pub analyzed:           usize,
  /// Records whose analysis read the full text.
  pub full_text_analyzed: usize,
  /// Earliest and latest publication year.
  pub year_range:         Option<(i32, i32)>,
  /// Most frequent publication year, the earliest on ties.
  pub most_common_year:   Option<i32>,
}

impl RunStatistics {
  /// Computes the statistics of `checkpoint`.
  pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
    let records = &checkpoint.records;
    let mut years: BTreeMap<i32, usize> = BTreeMap::new();
    for year in records.iter().filter_map(|r| r.entry.year) {
      *years.entry(year).or_insert(0) += 1;
    }
    let year_range = years.keys().next().copied().zip(years.keys().next_back().copied());
    let most_common_year = years
      .iter()
      .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
      .map(|(year, _)| *year);

    Self {
      total: records.len(),
      passed_screening: records.iter().filter(|r| r.output(Stage::Screen).is_some()).count(),
      analyzed: records.iter().filter(|r| r.output(Stage::Analyze).is_some()).count(),
      full_text_analyzed: records
        .iter()
        .filter(|r| r.output(Stage::Analyze).and_then(|o| o.get("full_text")).is_some())
        .count(),
      year_range,
      most_common_year,
    }
  }

  /// Percentage of all records that passed screening.
  pub fn screening_rate(&self) -> Option<f64> { self.rate(self.passed_screening) }

  /// Percentage of all records that were analyzed.
  pub fn analysis_rate(&self) -> Option<f64> { self.rate(self.analyzed) }

  fn rate(&self, part: usize) -> Option<f64> {
    (self.total > 0).then(|| part as f64 / self.total as f64 * 100.0)
  }

  fn lines(&self) -> String {
    let mut text = format!(
      "- Records: {}\n- Passed screening: {} ({})\n- Analyzed: {} ({})\n- Full text analyzed: {}",
      self.total,
      self.passed_screening,
      percent(self.screening_rate()),
      self.analyzed,
      percent(self.analysis_rate()),
      self.full_text_analyzed,
    );
    if let Some((first, last)) = self.year_range {
      text.push_str(&format!("\n- Publication years: {first}-{last}"));
    }
    text
  }
}

fn percent(rate: Option<f64>) -> String {
  rate.map_or_else(|| "n/a".to_string(), |rate| format!("{rate:.1}%"))
}

/// Numbered summaries of the accepted records, for the report prompt.
fn summaries(records: &[Record]) -> String {
  let summaries: Vec<String> = records
    .iter()
    .filter(|r| r.output(Stage::Screen).is_some())
    .take(REPORT_SUMMARY_LIMIT)
    .enumerate()
    .map(|(i, record)| {
      let year = record.entry.year.map_or_else(|| "n.d.".to_string(), |y| y.to_string());
      let heading = format!("**[{}] {}** ({year})", i + 1, record.entry.title);
      let summary = record
        .output(Stage::Analyze)
        .and_then(|o| o.pointer("/summary/summary"))
        .and_then(Value::as_str);
      match summary {
        Some(summary) => format!("{heading}\n   {summary}"),
        None => heading,
      }
    })
    .collect();
  if summaries.is_empty() {
    "No summaries available.".to_string()
  } else {
    summaries.join("\n\n")
  }
}

/// The report of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
  /// Run identifier.
  pub run_id:       String,
  /// Research topic.
  pub topic:        String,
  /// When the report was generated.
  pub generated_at: DateTime<Utc>,
  /// Counts over the run.
  pub statistics:   RunStatistics,
  /// Model-written body. `None` when the report fell back to statistics only.
  pub narrative:    Option<String>,
}

impl RunReport {
  /// Builds the report of `checkpoint`, asking `llm` for the narrative when one is given.
  pub async fn generate(
    checkpoint: &Checkpoint,
    topic: &str,
    llm: Option<&dyn LanguageModel>,
  ) -> Self {
    let statistics = RunStatistics::from_checkpoint(checkpoint);
    let narrative = match llm {
      Some(llm) => {
        let summaries = summaries(&checkpoint.records);
        let request = ChatRequest::new("report")
          .with_system(render(REPORT_SYSTEM, &[("topic", topic)]))
          .with_message(render(REPORT_USER, &[
            ("topic", topic),
            ("statistics", statistics.lines().as_str()),
            ("summaries", truncate(&summaries, REPORT_SUMMARY_CHARS)),
          ]))
          .with_temperature(0.3)
          .with_max_tokens(3000);
        match llm.complete(request).await {
          Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
          Ok(_) => {
            warn!("The model returned an empty report; falling back to statistics");
            None
          },
          Err(e) => {
            warn!("Report synthesis failed: {e}; falling back to statistics");
            None
          },
        }
      },
      None => {
        info!("No language model available; writing a statistics-only report");
        None
      },
    };

    Self {
      run_id: checkpoint.run_id.clone(),
      topic: topic.to_string(),
      generated_at: Utc::now(),
      statistics,
      narrative,
    }
  }

  /// Whether the narrative is missing.
  pub fn is_fallback(&self) -> bool { self.narrative.is_none() }

  /// Renders the report as Markdown.
  pub fn to_markdown(&self) -> String {
    let stats = &self.statistics;
    let body = self.narrative.clone().unwrap_or_else(|| {
      "_Fallback report: the narrative could not be generated. The statistics below are \
       complete; per-record results are in report.json._"
        .to_string()
    });

    let mut text = format!(
      "# Literature report: {}\n\nRun `{}`, generated {}. {} records, {} included.\n\n---\n\n{body}\n\n---\n\n",
      self.topic,
      self.run_id,
      self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
      stats.total,
      stats.passed_screening,
    );
    text.push_str("## Appendix: statistics\n\n| Metric | Value |\n|---|---|\n");
    text.push_str(&format!("| Records | {} |\n", stats.total));
    text.push_str(&format!(
      "| Passed screening | {} ({}) |\n",
      stats.passed_screening,
      percent(stats.screening_rate())
    ));
    text.push_str(&format!("| Analyzed | {} ({}) |\n", stats.analyzed, percent(stats.analysis_rate())));
    text.push_str(&format!("| Full text analyzed | {} |\n", stats.full_text_analyzed));
    if let Some((first, last)) = stats.year_range {
      text.push_str(&format!("| Publication years | {first}-{last} |\n"));
    }
    if let Some(year) = stats.most_common_year {
      text.push_str(&format!("| Most common year | {year} |\n"));
    }
    text
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{record::Entry, stages::tests::CannedModel};

  fn checkpoint() -> Checkpoint {
    let mut accepted = Record::new(Entry {
      title: "Deep soil carbon".into(),
      year: Some(2019),
      ..Entry::default()
    });
    accepted.begin(Stage::Preprocess).unwrap();
    accepted.complete(Stage::Preprocess, Value::Null).unwrap();
    accepted.begin(Stage::Screen).unwrap();
    accepted.complete(Stage::Screen, json!({ "decision": "accept" })).unwrap();
    accepted.begin(Stage::Analyze).unwrap();
    accepted
      .complete(Stage::Analyze, json!({ "summary": { "summary": "Stocks decline with depth." } }))
      .unwrap();

    let mut rejected =
      Record::new(Entry { title: "Urban heat".into(), year: Some(2021), ..Entry::default() });
    rejected.begin(Stage::Preprocess).unwrap();
    rejected.complete(Stage::Preprocess, Value::Null).unwrap();
    rejected.begin(Stage::Screen).unwrap();
    rejected.skip(Stage::Screen, "rejected").unwrap();

    let undated = Record::new(Entry { title: "Undated".into(), ..Entry::default() });
    Checkpoint::new("r1", vec![accepted, rejected, undated])
  }

  #[test]
  fn counts_the_run() {
    let stats = RunStatistics::from_checkpoint(&checkpoint());
    assert_eq!(stats.total, 3);
    assert_eq!(stats.passed_screening, 1);
    assert_eq!(stats.analyzed, 1);
    assert_eq!(stats.full_text_analyzed, 0);
    assert_eq!(stats.year_range, Some((2019, 2021)));
    assert_eq!(stats.most_common_year, Some(2019));
    assert_eq!(percent(stats.screening_rate()), "33.3%");

    let empty = RunStatistics::from_checkpoint(&Checkpoint::new("r2", Vec::new()));
    assert_eq!(empty.screening_rate(), None);
    assert_eq!(empty.year_range, None);
  }

  #[tokio::test]
  async fn narrative_comes_from_the_model() {
    let llm = CannedModel::new(vec!["## Overview\nCarbon declines with depth.\n"]);
    let model: &dyn LanguageModel = llm.as_ref();
    let report = RunReport::generate(&checkpoint(), "soil carbon", Some(model)).await;

    assert!(!report.is_fallback());
    let markdown = report.to_markdown();
    assert!(markdown.starts_with("# Literature report: soil carbon"));
    assert!(markdown.contains("## Overview\nCarbon declines with depth."));
    assert!(markdown.contains("| Records | 3 |"));
    assert!(markdown.contains("| Most common year | 2019 |"));

    let request = &llm.requests()[0];
    assert_eq!(request.temperature, Some(0.3));
    let prompt = &request.messages[1].content;
    assert!(prompt.contains("**[1] Deep soil carbon** (2019)\n   Stocks decline with depth."));
    assert!(prompt.contains("- Passed screening: 1 (33.3%)"));
    assert!(!prompt.contains("Urban heat"));
  }

  #[traced_test]
  #[tokio::test]
  async fn falls_back_to_statistics() {
    let llm = CannedModel::failing(SifterError::TransientNetwork("reset".into()));
    let model: &dyn LanguageModel = llm.as_ref();
    let report = RunReport::generate(&checkpoint(), "soil carbon", Some(model)).await;
    assert!(report.is_fallback());
    assert!(report.to_markdown().contains("Fallback report"));
    assert!(report.to_markdown().contains("| Passed screening | 1 (33.3%) |"));
    assert!(logs_contain("falling back to statistics"));

    let report = RunReport::generate(&checkpoint(), "soil carbon", None).await;
    assert!(report.is_fallback());
  }
}
