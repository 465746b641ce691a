//! Prompt templates for the model-backed stages.
//!
//! Templates use `{name}` placeholders filled by [`render`]. Topic and criteria come from
//! [`PipelineConfig`](crate::config::PipelineConfig), so the same templates serve any review.

/// System message for screening.
pub const SCREEN_SYSTEM: &str = "You are a careful research assistant screening scientific \
                                 literature for a systematic review on {topic}. Judge only from \
                                 the text you are given.";

/// User message for screening one record.
pub const SCREEN_USER: &str = r#"Decide whether the paper below should be included.

Inclusion criteria:
{criteria}

Title: {title}
Abstract: {abstract}

Reply with a single JSON object and nothing else:
{"decision": "accept" or "reject", "relevant": true/false, "has_data": true/false, "is_review": true/false, "reason": "<one sentence>", "confidence": <number between 0 and 1>}"#;

/// System message for analysis.
pub const ANALYZE_SYSTEM: &str = "You extract structured findings from scientific papers about \
                                  {topic}. Report only what the text states.";

/// User message for abstract-level analysis.
pub const ANALYZE_USER: &str = r#"Summarize the paper below and extract its quantitative findings.

Title: {title}
Abstract: {abstract}

Reply with a single JSON object and nothing else:
{"summary": "<three sentences at most>", "methods": ["..."], "findings": [{"variable": "...", "value": "...", "unit": "...", "context": "..."}], "study_region": "<or null>"}"#;

/// User message for full-text analysis.
pub const DEEP_ANALYZE_USER: &str = r#"Below is text extracted from the first pages of a paper. Extract the detailed quantitative findings relevant to {topic}.

Title: {title}

Full text:
{text}

Reply with a single JSON object and nothing else:
{"key_results": ["..."], "measurements": [{"variable": "...", "value": "...", "unit": "...", "depth_or_condition": "..."}], "limitations": ["..."]}"#;

/// Maximum characters of full text sent with [`DEEP_ANALYZE_USER`].
pub const DEEP_TEXT_LIMIT: usize = 12_000;

/// System message for the run report.
pub const REPORT_SYSTEM: &str = "You write concise, well structured research reports on {topic} \
                                 from the results of a literature screening and analysis run.";

/// User message for the run report.
pub const REPORT_USER: &str = r#"Write a research report in Markdown from the results below.

Topic: {topic}

Run statistics:
{statistics}

Summaries of included papers:
{summaries}

Use these sections: Overview, Main findings (3 to 5 points), Characteristics of the data, Trends over time, Methods, Recommendations for further research (2 or 3 points). Support statements with the numbers above. Aim for 800 to 1200 words and reply with the report only."#;

/// Included papers whose summaries go into [`REPORT_USER`].
pub const REPORT_SUMMARY_LIMIT: usize = 30;

/// Maximum characters of summaries sent with [`REPORT_USER`].
pub const REPORT_SUMMARY_CHARS: usize = 3_000;

/// Fills `{key}` placeholders in `template`. Unknown placeholders are left as they are.
///
/// # Examples
///
/// ```
/// use sifter::prompts::render;
///
/// assert_eq!(render("Title: {title}", &[("title", "Soil")]), "Title: Soil");
/// ```
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
  values
    .iter()
    .fold(template.to_string(), |text, (key, value)| text.replace(&format!("{{{key}}}"), value))
}

/// Truncates `text` to at most `limit` characters on a character boundary.
pub fn truncate(text: &str, limit: usize) -> &str {
  match text.char_indices().nth(limit) {
    Some((index, _)) => &text[..index],
    None => text,
  }
}
