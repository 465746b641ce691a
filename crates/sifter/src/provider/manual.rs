//! Drop directory for manually acquired PDFs.
//!
//! Operators work through the manual queue, download what they can by hand, and save each file
//! in the manual directory under one of these names:
//!
//! - `<doi with '/' replaced by '_'>.pdf`, e.g. `10.1016_j.geoderma.2020.114.pdf`
//! - `<record id with ':' and '/' replaced by '_'>.pdf`, e.g. `h_3fa2....pdf`
//!
//! The next `run --resume --force-acquire` picks them up.

use super::*;

/// Replaces characters that cannot appear in file names.
pub fn file_stem(key: &str) -> String { key.replace(['/', ':', '\\'], "_") }

/// Provider that looks for files in a local directory.
#[derive(Debug, Clone)]
pub struct ManualDirectoryProvider {
  name: String,
  dir:  PathBuf,
}

impl ManualDirectoryProvider {
  /// Creates a provider reading from `dir`.
  pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
    Self { name: name.into(), dir: dir.into() }
  }

  /// File names this provider accepts for `identifier`, in lookup order.
  pub fn candidates(&self, identifier: &Identifier) -> Vec<PathBuf> {
    let mut names = Vec::new();
    if let Some(doi) = &identifier.doi {
      names.push(format!("{}.pdf", file_stem(doi)));
    }
    names.push(format!("{}.pdf", file_stem(&identifier.record_id)));
    names.into_iter().map(|name| self.dir.join(name)).collect()
  }
}

#[async_trait]
impl Provider for ManualDirectoryProvider {
  fn name(&self) -> &str { &self.name }

  async fn lookup(&self, identifier: &Identifier) -> Lookup {
    for path in self.candidates(identifier) {
      match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => return Lookup::Found(ArtifactLocation::Local(path)),
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Lookup::Error(CallError::Transient(e.to_string())),
      }
    }
    Lookup::NotFound
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn finds_files_by_doi_or_id() {
    let dir = tempdir().unwrap();
    let provider = ManualDirectoryProvider::new("manual", dir.path());
    let identifier = Identifier {
      record_id: "doi:10.1016/j.geoderma.2020.114".into(),
      doi:       Some("10.1016/j.geoderma.2020.114".into()),
      title:     "Soil".into(),
      author:    None,
      year:      None,
    };
    assert_eq!(provider.lookup(&identifier).await, Lookup::NotFound);

    let path = dir.path().join("10.1016_j.geoderma.2020.114.pdf");
    std::fs::write(&path, b"%PDF-1.4").unwrap();
    assert_eq!(provider.lookup(&identifier).await, Lookup::Found(ArtifactLocation::Local(path)));

    let hashed = Identifier { record_id: "h:abc".into(), doi: None, ..identifier };
    let path = dir.path().join("h_abc.pdf");
    std::fs::write(&path, b"%PDF-1.4").unwrap();
    assert_eq!(provider.lookup(&hashed).await, Lookup::Found(ArtifactLocation::Local(path)));
  }
}
