//! Client for OpenAI-compatible chat completion endpoints.
//!
//! Stage processors talk to the model through the [`LanguageModel`] trait so tests can inject a
//! scripted fake. The production implementation, [`ChatClient`], sends every request through the
//! shared [`RateLimitedClient`] under the `llm` target, which gives it the same throttling,
//! backoff and audit trail as the document providers.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sifter::{
//!   client::RateLimitedClient,
//!   config::Config,
//!   llm::{ChatClient, ChatRequest, LanguageModel},
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(Config::default_path())?;
//! let client = Arc::new(RateLimitedClient::new(&config.rate_limit));
//! let llm = ChatClient::new(&config.llm, client)?;
//!
//! let reply = llm
//!   .complete(ChatRequest::new("summary").with_message("Summarize soil carbon saturation."))
//!   .await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use super::*;
use crate::{
  client::{retry_after, Operation, RateLimitedClient},
  config::LlmConfig,
};

lazy_static! {
  static ref FENCED_JSON: Regex =
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fence pattern");
}

/// Throttling target shared by every model call.
pub const LLM_TARGET: &str = "llm";

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  /// `system`, `user` or `assistant`.
  pub role:    String,
  /// Message text.
  pub content: String,
}

/// One chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
  /// Operation name used in logs and the audit trail, e.g. `screen`.
  pub operation:   String,
  /// Conversation so far.
  pub messages:    Vec<Message>,
  /// Overrides the configured temperature.
  pub temperature: Option<f32>,
  /// Overrides the configured completion cap.
  pub max_tokens:  Option<u32>,
  /// Ask the endpoint for a JSON object response.
  pub json_mode:   bool,
}

impl ChatRequest {
  /// Starts an empty request for `operation`.
  pub fn new(operation: impl Into<String>) -> Self {
    Self {
      operation:   operation.into(),
      messages:    Vec::new(),
      temperature: None,
      max_tokens:  None,
      json_mode:   false,
    }
  }

  /// Adds a system message.
  pub fn with_system(mut self, content: impl Into<String>) -> Self {
    self.messages.push(Message { role: "system".into(), content: content.into() });
    self
  }

  /// Adds a user message.
  pub fn with_message(mut self, content: impl Into<String>) -> Self {
    self.messages.push(Message { role: "user".into(), content: content.into() });
    self
  }

  /// Sets the sampling temperature.
  pub fn with_temperature(mut self, temperature: f32) -> Self {
    self.temperature = Some(temperature);
    self
  }

  /// Caps the completion length.
  pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
    self.max_tokens = Some(max_tokens);
    self
  }

  /// Requests a JSON object response.
  pub fn with_json_mode(mut self) -> Self {
    self.json_mode = true;
    self
  }
}

/// Anything that can complete a chat.
#[async_trait]
pub trait LanguageModel: Send + Sync {
  /// Returns the assistant's reply text.
  async fn complete(&self, request: ChatRequest) -> Result<String>;

  /// Completes `request` and parses a JSON object out of the reply.
  async fn complete_json(&self, request: ChatRequest) -> Result<Value> {
    let reply = self.complete(request.with_json_mode()).await?;
    extract_json(&reply)
  }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
  model:           &'a str,
  messages:        &'a [Message],
  temperature:     f32,
  max_tokens:      u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
  #[serde(rename = "type")]
  kind: &'static str,
}

#[derive(Deserialize)]
struct Completion {
  choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
  message: Message,
}

/// [`LanguageModel`] backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatClient {
  config: LlmConfig,
  client: Arc<RateLimitedClient>,
}

impl ChatClient {
  /// Creates a client. Fails when no API key is configured.
  pub fn new(config: &LlmConfig, client: Arc<RateLimitedClient>) -> Result<Self> {
    if config.api_key.as_deref().map_or(true, str::is_empty) {
      return Err(SifterError::Config(format!(
        "no language model API key; set {} or llm.api_key",
        crate::config::env::LLM_API_KEY
      )));
    }
    Ok(Self { config: config.clone(), client })
  }

  fn endpoint(&self) -> String {
    format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
  }

  async fn send(&self, request: &ChatRequest) -> Result<String, CallError> {
    let body = CompletionBody {
      model:           &self.config.model,
      messages:        &request.messages,
      temperature:     request.temperature.unwrap_or(self.config.temperature),
      max_tokens:      request.max_tokens.unwrap_or(self.config.max_tokens),
      response_format: request.json_mode.then_some(ResponseFormat { kind: "json_object" }),
    };

    let response = self
      .client
      .http()
      .post(self.endpoint())
      .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
      .timeout(Duration::from_secs(self.config.timeout_secs))
      .json(&body)
      .send()
      .await?;

    if let Some(err) = CallError::from_status(response.status(), retry_after(response.headers())) {
      let text = response.text().await.unwrap_or_default();
      debug!("Model endpoint returned an error: {text}");
      return Err(match err {
        CallError::Permanent(msg) => CallError::Permanent(format!("{msg}: {text}")),
        other => other,
      });
    }

    let completion: Completion = response
      .json()
      .await
      .map_err(|e| CallError::Permanent(format!("unexpected completion payload: {e}")))?;
    completion
      .choices
      .into_iter()
      .next()
      .map(|choice| choice.message.content)
      .ok_or_else(|| CallError::Permanent("completion had no choices".into()))
  }
}

#[async_trait]
impl LanguageModel for ChatClient {
  async fn complete(&self, request: ChatRequest) -> Result<String> {
    let operation = Operation::new(LLM_TARGET, request.operation.clone());
    let reply = self.client.call(operation, || self.send(&request)).await?;
    trace!("{} reply: {reply}", request.operation);
    Ok(reply)
  }
}

/// Parses a JSON object out of a model reply.
///
/// Tries the whole reply, then a fenced code block, then the span between the first `{` and the
/// last `}`.
///
/// # Examples
///
/// ```
/// use sifter::llm::extract_json;
///
/// let reply = "Sure! ```json\n{\"decision\": \"accept\"}\n``` Hope that helps.";
/// assert_eq!(extract_json(reply).unwrap()["decision"], "accept");
/// ```
pub fn extract_json(reply: &str) -> Result<Value> {
  let reply = reply.trim();
  if let Ok(value) = serde_json::from_str::<Value>(reply) {
    if value.is_object() {
      return Ok(value);
    }
  }
  if let Some(block) = FENCED_JSON.captures(reply).and_then(|c| c.get(1)) {
    if let Ok(value) = serde_json::from_str::<Value>(block.as_str()) {
      return Ok(value);
    }
  }
  if let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) {
    if start < end {
      if let Ok(value) = serde_json::from_str::<Value>(&reply[start..=end]) {
        return Ok(value);
      }
    }
  }
  let preview: String = reply.chars().take(120).collect();
  Err(SifterError::PermanentProvider(format!("model reply is not JSON: {preview}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RateLimitConfig;

  #[test]
  fn extracts_json_variants() {
    assert_eq!(extract_json(r#"{"a": 1}"#).unwrap()["a"], 1);
    assert_eq!(extract_json("```\n{\"a\": 2}\n```").unwrap()["a"], 2);
    assert_eq!(extract_json("Result: {\"a\": {\"b\": 3}} done").unwrap()["a"]["b"], 3);
    assert!(extract_json("no json here").is_err());
    assert!(extract_json("[1, 2]").is_err());
  }

  #[test]
  fn requires_api_key() {
    let client = Arc::new(RateLimitedClient::new(&RateLimitConfig::default()));
    let config = LlmConfig::default();
    assert!(matches!(ChatClient::new(&config, client.clone()), Err(SifterError::Config(_))));

    let config = LlmConfig {
      api_key: Some("sk-test".into()),
      base_url: "http://localhost:8000/v1/".into(),
      ..LlmConfig::default()
    };
    let llm = ChatClient::new(&config, client).unwrap();
    assert_eq!(llm.endpoint(), "http://localhost:8000/v1/chat/completions");
  }

  #[test]
  fn serializes_request_body() {
    let messages = vec![Message { role: "user".into(), content: "hi".into() }];
    let body = CompletionBody {
      model:           "gpt-4o-mini",
      messages:        &messages,
      temperature:     0.1,
      max_tokens:      500,
      response_format: Some(ResponseFormat { kind: "json_object" }),
    };
    let json = serde_json::to_value(&body).unwrap();
    assert_eq!(json["response_format"]["type"], "json_object");
    assert_eq!(json["messages"][0]["role"], "user");
  }
}
