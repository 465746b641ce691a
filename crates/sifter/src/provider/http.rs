//! Configurable HTTP provider.

use url::form_urlencoded;

use super::{response::extract_location, *};
use crate::client::retry_after;

/// A provider backed by a web API, described entirely by its [`ProviderConfig`].
#[derive(Debug, Clone)]
pub struct HttpProvider {
  name:              String,
  endpoint_template: String,
  identifier:        IdentifierKind,
  response_format:   ResponseFormat,
  headers:           BTreeMap<String, String>,
  transform:         Option<Transform>,
  contact:           Option<String>,
  http:              reqwest::Client,
}

impl HttpProvider {
  /// Builds a provider from configuration.
  ///
  /// `contact` is substituted for `{contact}` in the template. Fails when the template is
  /// missing, does not mention `{identifier}`, or a replace transform does not compile.
  pub fn from_config(
    config: &ProviderConfig,
    http: reqwest::Client,
    contact: Option<String>,
  ) -> Result<Self> {
    let Some(template) = config.endpoint_template.clone() else {
      return Err(SifterError::Config(format!(
        "provider '{}' needs an endpoint_template",
        config.name
      )));
    };
    if !template.contains("{identifier}") {
      return Err(SifterError::Config(format!(
        "endpoint_template of provider '{}' must contain {{identifier}}",
        config.name
      )));
    }
    if template.contains("{contact}") && contact.is_none() {
      warn!("Provider '{}' wants a contact address but none is configured", config.name);
    }
    if let Some(Transform::Replace { pattern, .. }) = &config.transform {
      Regex::new(pattern)?;
    }
    Ok(Self {
      name: config.name.clone(),
      endpoint_template: template,
      identifier: config.identifier,
      response_format: config.response_format.clone(),
      headers: config.headers.clone(),
      transform: config.transform.clone(),
      contact,
      http,
    })
  }

  /// Renders the endpoint for `identifier`, or `None` when the needed key is missing.
  pub fn endpoint(&self, identifier: &Identifier) -> Option<String> {
    let key = match self.identifier {
      IdentifierKind::Doi => identifier.doi.clone()?,
      IdentifierKind::Title => {
        if identifier.title.is_empty() {
          return None;
        }
        form_urlencoded::byte_serialize(identifier.title.as_bytes()).collect()
      },
    };
    let contact: String =
      form_urlencoded::byte_serialize(self.contact.as_deref().unwrap_or("").as_bytes()).collect();
    Some(self.endpoint_template.replace("{identifier}", &key).replace("{contact}", &contact))
  }

  async fn fetch_location(&self, url: &str) -> Lookup {
    let mut request = self.http.get(url);
    for (key, value) in &self.headers {
      request = request.header(key, value);
    }

    let response = match request.send().await {
      Ok(response) => response,
      Err(e) => return Lookup::Error(e.into()),
    };
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
      return Lookup::NotFound;
    }
    if let Some(err) = CallError::from_status(status, retry_after(response.headers())) {
      return match err {
        CallError::RateLimited { retry_after } => Lookup::RateLimited { retry_after },
        other => Lookup::Error(other),
      };
    }

    let body = match response.bytes().await {
      Ok(body) => body,
      Err(e) => return Lookup::Error(e.into()),
    };
    trace!("{} response: {}", self.name, String::from_utf8_lossy(&body));

    match extract_location(&body, &self.response_format, self.transform.as_ref()) {
      Ok(Some(location)) => Lookup::Found(ArtifactLocation::Url(location)),
      Ok(None) => Lookup::NotFound,
      Err(e) => Lookup::Error(e),
    }
  }
}

#[async_trait]
impl Provider for HttpProvider {
  fn name(&self) -> &str { &self.name }

  async fn lookup(&self, identifier: &Identifier) -> Lookup {
    let Some(url) = self.endpoint(identifier) else {
      debug!("{} cannot look up {} without a {:?}", self.name, identifier.record_id, self.identifier);
      return Lookup::NotFound;
    };
    debug!("{} looking up {} via {}", self.name, identifier.record_id, url);

    if self.response_format == ResponseFormat::Direct {
      let location = match &self.transform {
        Some(transform) => match response::apply_transform(&url, transform) {
          Ok(url) => url,
          Err(e) => return Lookup::Error(e),
        },
        None => url,
      };
      return Lookup::Found(ArtifactLocation::Url(location));
    }
    self.fetch_location(&url).await
  }
}
