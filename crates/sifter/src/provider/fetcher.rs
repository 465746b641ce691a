//! Storing artifacts in the artifact directory.

use std::{io::Write, time::Duration};

use sha2::{Digest, Sha256};

use super::{manual::file_stem, *};
use crate::{client::retry_after, record::ArtifactRef};

/// Leading bytes of every PDF file.
const PDF_MAGIC: &[u8] = b"%PDF-";

/// Downloads or copies artifacts into `<artifact_dir>/<record id>.pdf`.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
  http:    reqwest::Client,
  dir:     PathBuf,
  timeout: Duration,
}

impl ArtifactFetcher {
  /// Creates a fetcher writing into `dir`.
  pub fn new(http: reqwest::Client, dir: impl Into<PathBuf>, timeout: Duration) -> Self {
    Self { http, dir: dir.into(), timeout }
  }

  /// Where the artifact of `record_id` is stored.
  pub fn path_for(&self, record_id: &str) -> PathBuf {
    self.dir.join(format!("{}.pdf", file_stem(record_id)))
  }

  /// Fetches `location` and stores it for `record_id`.
  ///
  /// Returns `Ok(None)` when a URL answers 404 or 410. Anything that is not a PDF is a permanent
  /// error, which covers the common case of a link resolving to an HTML landing page.
  pub async fn store(
    &self,
    record_id: &str,
    provider: &str,
    location: &ArtifactLocation,
  ) -> Result<Option<ArtifactRef>, CallError> {
    let bytes = match location {
      ArtifactLocation::Url(url) => match self.download(url).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
      },
      ArtifactLocation::Local(path) => tokio::fs::read(path)
        .await
        .map_err(|e| CallError::Transient(format!("reading {}: {e}", path.display())))?,
    };

    if !bytes.starts_with(PDF_MAGIC) {
      return Err(CallError::Permanent(format!("{location} did not return a PDF")));
    }

    let sha256 = hex::encode(Sha256::digest(&bytes));
    let size = bytes.len() as u64;
    let path = self.path_for(record_id);
    write_file(path.clone(), bytes)
      .await
      .map_err(|e| CallError::Transient(format!("writing {}: {e}", path.display())))?;
    debug!("Stored {} bytes for {} from {} at {}", size, record_id, provider, path.display());

    Ok(Some(ArtifactRef {
      provider: provider.to_string(),
      location: location.to_string(),
      path,
      sha256,
      bytes: size,
    }))
  }

  async fn download(&self, url: &str) -> Result<Option<Vec<u8>>, CallError> {
    let response = self.http.get(url).timeout(self.timeout).send().await?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
      return Ok(None);
    }
    if let Some(err) = CallError::from_status(status, retry_after(response.headers())) {
      return Err(err);
    }
    Ok(Some(response.bytes().await?.to_vec()))
  }
}

/// Writes through a temporary file so that a partial download never appears as an artifact.
async fn write_file(path: PathBuf, bytes: Vec<u8>) -> std::io::Result<()> {
  tokio::task::spawn_blocking(move || {
    let dir = path.parent().ok_or_else(|| std::io::Error::other("artifact path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".artifact.").tempfile_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(())
  })
  .await
  .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn copies_local_pdfs() {
    let source = tempdir().unwrap();
    let store = tempdir().unwrap();
    let pdf = source.path().join("paper.pdf");
    std::fs::write(&pdf, b"%PDF-1.7\nhello").unwrap();

    let fetcher =
      ArtifactFetcher::new(reqwest::Client::new(), store.path(), Duration::from_secs(5));
    let artifact = fetcher
      .store("doi:10.1/x", "manual", &ArtifactLocation::Local(pdf))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(artifact.path, store.path().join("doi_10.1_x.pdf"));
    assert_eq!(artifact.bytes, 14);
    assert_eq!(artifact.sha256.len(), 64);
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"%PDF-1.7\nhello");
  }

  #[tokio::test]
  async fn rejects_non_pdf_content() {
    let source = tempdir().unwrap();
    let page = source.path().join("landing.pdf");
    std::fs::write(&page, b"<!doctype html>").unwrap();

    let fetcher = ArtifactFetcher::new(reqwest::Client::new(), source.path(), Duration::from_secs(5));
    let result = fetcher.store("h:1", "manual", &ArtifactLocation::Local(page)).await;
    assert!(matches!(result, Err(CallError::Permanent(_))));
  }
}
