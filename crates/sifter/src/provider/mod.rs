//! Document providers.
//!
//! A provider answers one question: where can the full text of this record be found? Providers
//! are tried in configured priority order by the
//! [`AcquisitionChain`](crate::chain::AcquisitionChain). Two kinds ship with the crate:
//!
//! - [`HttpProvider`]: any web API described in configuration by an endpoint template and a path
//!   into its JSON or XML response.
//! - [`ManualDirectoryProvider`]: a directory where an operator drops PDFs obtained by hand.
//!
//! # Examples
//!
//! ```toml
//! [[providers]]
//! name = "unpaywall"
//! endpoint_template = "https://api.unpaywall.org/v2/{identifier}?email={contact}"
//! identifier = "doi"
//! [providers.response_format]
//! type = "json"
//! location_path = "best_oa_location/url_for_pdf"
//!
//! [[providers]]
//! name = "arxiv"
//! endpoint_template = "http://export.arxiv.org/api/query?search_query=ti:{identifier}&max_results=1"
//! identifier = "title"
//! [providers.response_format]
//! type = "xml"
//! strip_namespaces = true
//! location_path = "feed/entry/id"
//! [providers.transform]
//! type = "replace"
//! pattern = "/abs/"
//! replacement = "/pdf/"
//!
//! [[providers]]
//! name = "manual"
//! kind = "manual"
//! ```

use super::*;
use crate::{client::RateLimitedClient, config::Config, record::Record};

pub mod fetcher;
pub mod http;
pub mod manual;
pub mod response;

pub use self::{fetcher::ArtifactFetcher, http::HttpProvider, manual::ManualDirectoryProvider};

/// The lookup key handed to providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
  /// Record id, used for naming artifacts.
  pub record_id: String,
  /// Normalized DOI, if the record has one.
  pub doi:       Option<String>,
  /// Title as ingested.
  pub title:     String,
  /// First author, if known.
  pub author:    Option<String>,
  /// Publication year.
  pub year:      Option<i32>,
}

impl Identifier {
  /// Builds the lookup key for a record.
  pub fn from_record(record: &Record) -> Self {
    Self {
      record_id: record.id.clone(),
      doi:       record.entry.normalized_doi(),
      title:     record.entry.title.trim().to_string(),
      author:    record.entry.authors.first().cloned(),
      year:      record.entry.year,
    }
  }
}

/// Where a provider says the artifact is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
  /// Downloadable URL.
  Url(String),
  /// File already on local disk.
  Local(PathBuf),
}

impl std::fmt::Display for ArtifactLocation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ArtifactLocation::Url(url) => f.write_str(url),
      ArtifactLocation::Local(path) => write!(f, "{}", path.display()),
    }
  }
}

/// Answer of a single provider lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
  /// The provider knows where the artifact is.
  Found(ArtifactLocation),
  /// The provider does not have it.
  NotFound,
  /// The provider asked us to back off.
  RateLimited {
    /// Suggested wait.
    retry_after: Option<std::time::Duration>,
  },
  /// Anything else went wrong.
  Error(CallError),
}

/// A source of full-text documents.
#[async_trait]
pub trait Provider: Send + Sync {
  /// Unique name, used as the key in [`Record::attempts`].
  fn name(&self) -> &str;

  /// Looks up where the document for `identifier` can be obtained.
  async fn lookup(&self, identifier: &Identifier) -> Lookup;
}

/// Which provider implementation a [`ProviderConfig`] describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
  /// [`HttpProvider`].
  #[default]
  Http,
  /// [`ManualDirectoryProvider`].
  Manual,
}

/// Which identifier is substituted for `{identifier}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
  /// The normalized DOI. Records without one are reported as not found.
  #[default]
  Doi,
  /// The URL-encoded title.
  Title,
}

/// How to read a location out of a provider response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
  /// The rendered endpoint is itself the artifact URL. No lookup request is made.
  #[default]
  Direct,
  /// JSON body; `location_path` is a `/`-separated path, numeric parts index arrays.
  Json {
    /// Path to the artifact URL.
    location_path: String,
  },
  /// XML body, converted to JSON before applying `location_path`. Attributes appear as `@name`.
  Xml {
    /// Path to the artifact URL.
    location_path:    String,
    /// Remove namespace prefixes and declarations first.
    #[serde(default)]
    strip_namespaces: bool,
  },
}

/// Rewrites the extracted location before it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
  /// Regex replacement.
  Replace {
    /// Pattern to match.
    pattern:     String,
    /// Replacement text, `$1` style group references allowed.
    replacement: String,
  },
  /// Template expansion, `{value}` is replaced with the extracted text.
  Url {
    /// Template, e.g. `https://arxiv.org/pdf/{value}`.
    base:   String,
    /// Appended after expansion.
    #[serde(default)]
    suffix: Option<String>,
  },
}

/// Configuration of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
  /// Unique provider name.
  pub name:              String,
  /// Implementation.
  #[serde(default)]
  pub kind:              ProviderKind,
  /// URL template with `{identifier}` and optional `{contact}` placeholders. HTTP only.
  #[serde(default)]
  pub endpoint_template: Option<String>,
  /// Identifier substituted into the template.
  #[serde(default)]
  pub identifier:        IdentifierKind,
  /// How the response is read.
  #[serde(default)]
  pub response_format:   ResponseFormat,
  /// Extra request headers, e.g. credentials for an institutional proxy.
  #[serde(default)]
  pub headers:           BTreeMap<String, String>,
  /// Optional rewrite of the extracted location.
  #[serde(default)]
  pub transform:         Option<Transform>,
}

impl ProviderConfig {
  /// A manual drop directory provider.
  pub fn manual(name: impl Into<String>) -> Self {
    Self {
      name:              name.into(),
      kind:              ProviderKind::Manual,
      endpoint_template: None,
      identifier:        IdentifierKind::Doi,
      response_format:   ResponseFormat::Direct,
      headers:           BTreeMap::new(),
      transform:         None,
    }
  }

  /// An HTTP provider with the given endpoint template.
  pub fn http(name: impl Into<String>, endpoint_template: impl Into<String>) -> Self {
    Self {
      kind: ProviderKind::Http,
      endpoint_template: Some(endpoint_template.into()),
      ..Self::manual(name)
    }
  }

  /// Sets how the response is read.
  pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
    self.response_format = format;
    self
  }

  /// Sets which identifier is substituted.
  pub fn with_identifier(mut self, identifier: IdentifierKind) -> Self {
    self.identifier = identifier;
    self
  }

  /// Sets a location rewrite.
  pub fn with_transform(mut self, transform: Transform) -> Self {
    self.transform = Some(transform);
    self
  }
}

/// Instantiates the configured providers in priority order.
pub fn build_providers(
  config: &Config,
  client: &RateLimitedClient,
) -> Result<Vec<Arc<dyn Provider>>> {
  config
    .providers
    .iter()
    .map(|provider| -> Result<Arc<dyn Provider>> {
      Ok(match provider.kind {
        ProviderKind::Http => Arc::new(HttpProvider::from_config(
          provider,
          client.http().clone(),
          config.acquisition.contact_email.clone(),
        )?),
        ProviderKind::Manual =>
          Arc::new(ManualDirectoryProvider::new(provider.name.clone(), config.manual_dir())),
      })
    })
    .collect()
}
