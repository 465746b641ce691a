//! Reading artifact locations out of provider responses.
//!
//! XML bodies are first converted into a JSON value (elements become keys, repeated elements
//! become arrays, attributes become `@name` keys and text becomes `$text` or the bare value), so a
//! single path syntax covers both formats.

use quick_xml::{events::Event, Reader};
use serde_json::Map;

use super::*;

lazy_static! {
  static ref NAMESPACE_DECL: Regex =
    Regex::new(r#"\s+xmlns(?::\w+)?="[^"]*""#).expect("valid namespace pattern");
  static ref NAMESPACE_PREFIX: Regex =
    Regex::new(r"(</?)[A-Za-z_][\w.-]*:").expect("valid prefix pattern");
}

/// Follows a `/`-separated path through a JSON value. Numeric parts index into arrays.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use sifter::provider::response::get_by_path;
///
/// let value = json!({"oa_locations": [{"url": "a"}, {"url": "b"}]});
/// assert_eq!(get_by_path(&value, "oa_locations/1/url"), Some(&json!("b")));
/// assert_eq!(get_by_path(&value, "oa_locations/5/url"), None);
/// ```
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
  let mut current = value;
  for part in path.split('/').filter(|p| !p.is_empty()) {
    current = match part.parse::<usize>() {
      Ok(index) => current.as_array()?.get(index)?,
      Err(_) => current.get(part)?,
    };
  }
  Some(current)
}

/// Removes namespace declarations and element prefixes.
pub fn strip_namespaces(xml: &str) -> String {
  let without_decls = NAMESPACE_DECL.replace_all(xml, "");
  NAMESPACE_PREFIX.replace_all(&without_decls, "$1").into_owned()
}

/// Converts an XML document into an equivalent JSON value.
pub fn xml_to_json(xml: &str) -> Result<Value, CallError> {
  let mut reader = Reader::from_str(xml);
  let mut stack: Vec<(String, Map<String, Value>)> = Vec::new();
  let mut current = Map::new();

  loop {
    match reader.read_event() {
      Ok(Event::Start(ref e)) => {
        let mut element = Map::new();
        for attr in e.attributes().flatten() {
          let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
          if let Ok(value) = attr.unescape_value() {
            element.insert(format!("@{key}"), Value::String(value.into_owned()));
          }
        }
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        stack.push((tag, std::mem::replace(&mut current, element)));
      },
      Ok(Event::Empty(ref e)) => {
        let mut element = Map::new();
        for attr in e.attributes().flatten() {
          let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
          if let Ok(value) = attr.unescape_value() {
            element.insert(format!("@{key}"), Value::String(value.into_owned()));
          }
        }
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        insert_child(&mut current, tag, Value::Object(element));
      },
      Ok(Event::Text(e)) => {
        let text = e.unescape().map_err(|e| CallError::Permanent(format!("bad XML text: {e}")))?;
        let text = text.trim();
        if !text.is_empty() {
          current.insert("$text".into(), Value::String(text.to_string()));
        }
      },
      Ok(Event::End(_)) => {
        let Some((tag, mut parent)) = stack.pop() else {
          return Err(CallError::Permanent("unbalanced XML".into()));
        };
        let value = if current.len() == 1 && current.contains_key("$text") {
          current.remove("$text").unwrap_or(Value::Null)
        } else {
          Value::Object(current)
        };
        insert_child(&mut parent, tag, value);
        current = parent;
      },
      Ok(Event::Eof) => break,
      Ok(_) => {},
      Err(e) => return Err(CallError::Permanent(format!("invalid XML: {e}"))),
    }
  }

  Ok(Value::Object(current))
}

/// Adds `value` under `tag`, turning repeated tags into arrays.
fn insert_child(parent: &mut Map<String, Value>, tag: String, value: Value) {
  match parent.get_mut(&tag) {
    Some(Value::Array(items)) => items.push(value),
    Some(existing) => {
      let first = existing.take();
      *existing = Value::Array(vec![first, value]);
    },
    None => {
      parent.insert(tag, value);
    },
  }
}

/// Applies a configured rewrite to an extracted location.
pub fn apply_transform(value: &str, transform: &Transform) -> Result<String, CallError> {
  match transform {
    Transform::Replace { pattern, replacement } => {
      let re = Regex::new(pattern)
        .map_err(|e| CallError::Permanent(format!("invalid transform pattern: {e}")))?;
      Ok(re.replace_all(value, replacement.as_str()).into_owned())
    },
    Transform::Url { base, suffix } =>
      Ok(format!("{}{}", base.replace("{value}", value), suffix.as_deref().unwrap_or(""))),
  }
}

/// Extracts the artifact location from a response body.
///
/// Returns `Ok(None)` when the path is absent, null or an empty string.
pub fn extract_location(
  body: &[u8],
  format: &ResponseFormat,
  transform: Option<&Transform>,
) -> Result<Option<String>, CallError> {
  let (value, path) = match format {
    ResponseFormat::Direct => return Ok(None),
    ResponseFormat::Json { location_path } => {
      let value: Value = serde_json::from_slice(body)
        .map_err(|e| CallError::Permanent(format!("invalid JSON response: {e}")))?;
      (value, location_path)
    },
    ResponseFormat::Xml { location_path, strip_namespaces: strip } => {
      let text = String::from_utf8_lossy(body);
      let xml = if *strip { strip_namespaces(&text) } else { text.into_owned() };
      (xml_to_json(&xml)?, location_path)
    },
  };

  let location = match get_by_path(&value, path) {
    Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
    Some(Value::Object(map)) => match map.get("$text").and_then(Value::as_str) {
      Some(s) if !s.trim().is_empty() => s.trim().to_string(),
      _ => return Ok(None),
    },
    _ => return Ok(None),
  };

  match transform {
    Some(transform) => apply_transform(&location, transform).map(Some),
    None => Ok(Some(location)),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn json_location() {
    let body = br#"{"best_oa_location": {"url_for_pdf": "https://example.org/a.pdf"}}"#;
    let format = ResponseFormat::Json { location_path: "best_oa_location/url_for_pdf".into() };
    assert_eq!(
      extract_location(body, &format, None).unwrap().as_deref(),
      Some("https://example.org/a.pdf")
    );

    let body = br#"{"best_oa_location": null}"#;
    assert_eq!(extract_location(body, &format, None).unwrap(), None);

    assert!(matches!(
      extract_location(b"<html>", &format, None),
      Err(CallError::Permanent(_))
    ));
  }

  #[test]
  fn xml_with_namespaces_and_repeats() {
    let body = br#"<?xml version="1.0"?>
      <feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
        <entry>
          <id>http://arxiv.org/abs/2301.07041v1</id>
          <link href="http://arxiv.org/abs/2301.07041v1" rel="alternate"/>
          <link title="pdf" href="http://arxiv.org/pdf/2301.07041v1" rel="related"/>
          <arxiv:comment>12 pages</arxiv:comment>
        </entry>
      </feed>"#;
    let format =
      ResponseFormat::Xml { location_path: "feed/entry/link/1/@href".into(), strip_namespaces: true };
    assert_eq!(
      extract_location(body, &format, None).unwrap().as_deref(),
      Some("http://arxiv.org/pdf/2301.07041v1")
    );

    let format =
      ResponseFormat::Xml { location_path: "feed/entry/id".into(), strip_namespaces: true };
    let transform = Transform::Replace { pattern: "/abs/".into(), replacement: "/pdf/".into() };
    assert_eq!(
      extract_location(body, &format, Some(&transform)).unwrap().as_deref(),
      Some("http://arxiv.org/pdf/2301.07041v1")
    );

    let json = xml_to_json(&strip_namespaces(&String::from_utf8_lossy(body))).unwrap();
    assert_eq!(get_by_path(&json, "feed/entry/comment"), Some(&json!("12 pages")));
  }

  #[test]
  fn url_transform() {
    let transform =
      Transform::Url { base: "https://arxiv.org/pdf/{value}".into(), suffix: Some(".pdf".into()) };
    assert_eq!(apply_transform("2301.07041", &transform).unwrap(), "https://arxiv.org/pdf/2301.07041.pdf");
  }
}
