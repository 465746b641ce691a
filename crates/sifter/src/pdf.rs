//! Text and metadata extraction from acquired PDFs.
//!
//! Parsing is CPU bound and synchronous, so [`extract`] runs on the blocking pool.

use lopdf::{Dictionary, Document};

use super::*;

/// Document information dictionary fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfMetadata {
  /// `/Title`.
  pub title:    Option<String>,
  /// `/Author`.
  pub author:   Option<String>,
  /// `/Subject`.
  pub subject:  Option<String>,
  /// `/Keywords`.
  pub keywords: Option<String>,
}

/// Text of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
  /// 1-based page number.
  pub number: u32,
  /// Extracted text.
  pub text:   String,
}

/// What was read out of a PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfContent {
  /// Info dictionary.
  pub metadata:    PdfMetadata,
  /// Pages that were read, in order.
  pub pages:       Vec<PageText>,
  /// Total number of pages in the document.
  pub total_pages: usize,
}

impl PdfContent {
  /// All extracted text, pages separated by blank lines.
  pub fn text(&self) -> String {
    self.pages.iter().map(|p| p.text.trim()).filter(|t| !t.is_empty()).collect::<Vec<_>>().join("\n\n")
  }
}

/// Reads metadata and the text of at most `max_pages` pages from `path`.
///
/// Pages whose text cannot be decoded are skipped rather than failing the whole document.
pub async fn extract(path: impl AsRef<Path>, max_pages: usize) -> Result<PdfContent> {
  let path = path.as_ref().to_path_buf();
  tokio::task::spawn_blocking(move || extract_blocking(&path, max_pages))
    .await
    .map_err(|e| SifterError::Io(std::io::Error::other(e)))?
}

fn extract_blocking(path: &Path, max_pages: usize) -> Result<PdfContent> {
  let doc = Document::load(path)?;
  let metadata = metadata(&doc);

  let numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
  let mut pages = Vec::new();
  for number in numbers.iter().copied().take(max_pages) {
    match doc.extract_text(&[number]) {
      Ok(text) => pages.push(PageText { number, text }),
      Err(e) => debug!("Skipping page {number} of {}: {e}", path.display()),
    }
  }

  Ok(PdfContent { metadata, pages, total_pages: numbers.len() })
}

fn metadata(doc: &Document) -> PdfMetadata {
  let info = doc
    .trailer
    .get(b"Info")
    .ok()
    .and_then(|o| o.as_reference().ok())
    .and_then(|id| doc.get_object(id).ok())
    .and_then(|o| o.as_dict().ok());

  let Some(info) = info else { return PdfMetadata::default() };
  PdfMetadata {
    title:    text_entry(info, "Title"),
    author:   text_entry(info, "Author"),
    subject:  text_entry(info, "Subject"),
    keywords: text_entry(info, "Keywords"),
  }
}

/// Decodes a text string, honoring a UTF-16BE byte order mark.
fn text_entry(dict: &Dictionary, key: &str) -> Option<String> {
  let bytes = dict.get(key.as_bytes()).ok()?.as_str().ok()?;
  let text = match bytes.strip_prefix(&[0xFE, 0xFF]) {
    Some(utf16) => {
      let units = utf16.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
      char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
    },
    None => String::from_utf8_lossy(bytes).into_owned(),
  };
  let text = text.trim().to_string();
  (!text.is_empty()).then_some(text)
}
