//! Capture records and on-disk export

use crate::errors::Result;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One observed request/response exchange.
///
/// A record only exists for responses whose body parsed as JSON; the
/// response body is therefore always a structured value, never raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
  /// 1-based insertion index, assigned when the record enters the buffer
  pub ordinal: u64,
  /// RFC 3339 wall clock taken when the response completed
  pub timestamp: String,
  /// The request as it left the proxy
  pub request: CapturedRequest,
  /// The upstream response
  pub response: CapturedResponse,
}

/// Request half of a capture record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
  /// Absolute URL including scheme
  pub url: String,
  /// HTTP method
  pub method: String,
  /// Request headers, lowercase names, proxy-only headers removed
  pub headers: BTreeMap<String, String>,
  /// Parsed JSON body, the raw text when it was not JSON, or null
  pub body: serde_json::Value,
}

/// Response half of a capture record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
  /// Upstream status code
  pub status_code: u16,
  /// Response headers, lowercase names
  pub headers: BTreeMap<String, String>,
  /// Fully parsed JSON body
  pub body: serde_json::Value,
}

impl CaptureRecord {
  /// One-line summary for the operator listing.
  pub fn summary(&self) -> String {
    format!(
      "{} {} -> {} ({} bytes)",
      self.request.method,
      self.request.url,
      self.response.status_code,
      serde_json::to_vec(&self.response.body)
        .map(|b| b.len())
        .unwrap_or(0),
    )
  }
}

/// Flatten a `HeaderMap` into the record representation: lowercase names,
/// duplicate values joined with `, `.
pub(crate) fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut map = BTreeMap::new();
  for (name, value) in headers {
    let value = String::from_utf8_lossy(value.as_bytes()).to_string();
    map
      .entry(name.as_str().to_ascii_lowercase())
      .and_modify(|existing: &mut String| {
        existing.push_str(", ");
        existing.push_str(&value);
      })
      .or_insert(value);
  }
  map
}

pub(crate) fn now_rfc3339() -> String {
  OffsetDateTime::now_utc()
    .format(&Rfc3339)
    .unwrap_or_default()
}

pub(crate) fn epoch_millis() -> u128 {
  (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u128
}

/// File name for a single exported record:
/// `{method_lower}_{sanitized_path}_{epoch_ms}.json`.
///
/// The URL path is sanitized to `[A-Za-z0-9]` with underscores and
/// truncated to 50 characters.
pub fn export_file_name(record: &CaptureRecord) -> String {
  let path = record
    .request
    .url
    .parse::<http::Uri>()
    .map(|uri| uri.path().to_string())
    .unwrap_or_else(|_| "_".to_string());
  let sanitized: String = path
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
    .take(50)
    .collect();
  format!(
    "{}_{}_{}.json",
    record.request.method.to_ascii_lowercase(),
    sanitized,
    epoch_millis(),
  )
}

/// Export a single record as a pretty-printed JSON object.
///
/// Returns the path of the written file.
pub fn export_record(dir: &Path, record: &CaptureRecord) -> Result<PathBuf> {
  let path = dir.join(export_file_name(record));
  std::fs::write(&path, serde_json::to_vec_pretty(record)?)?;
  Ok(path)
}

/// Export a batch of records as a pretty-printed JSON array.
pub fn export_records(dir: &Path, records: &[CaptureRecord]) -> Result<PathBuf> {
  let path = dir.join(format!("captures_{}.json", epoch_millis()));
  std::fs::write(&path, serde_json::to_vec_pretty(records)?)?;
  Ok(path)
}
