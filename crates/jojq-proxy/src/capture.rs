//! Response capture pipeline
//!
//! Every completed response funnels through [`finish_response`]: a
//! content-type gate, content-encoding decode, a size cap and a JSON
//! parse. Only responses that clear all four produce a capture record.
//! Failures here never affect what the client already received.

use crate::buffer::CaptureBuffer;
use crate::http1::BodyTee;
use crate::record::{
  flatten_headers, now_rfc3339, CaptureRecord, CapturedRequest, CapturedResponse,
};
use brotli::Decompressor;
use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http::{HeaderMap, Method, StatusCode};
use std::io::Read;

/// Default cap on the decoded response body (25 MB).
pub const MAX_CAPTURE_BODY: usize = 25 * 1024 * 1024;

/// Request-side metadata carried through to the capture record.
#[derive(Debug)]
pub struct RequestParts {
  /// HTTP method
  pub method: Method,
  /// Absolute URL including scheme
  pub url: String,
  /// Headers as sent, minus proxy-only headers
  pub headers: HeaderMap,
  /// Raw request body
  pub body: Bytes,
}

/// Run the capture pipeline for one completed exchange.
///
/// Returns the assigned insertion ordinal when a record was produced.
pub fn finish_response(
  buffer: &CaptureBuffer,
  request: &RequestParts,
  status: StatusCode,
  response_headers: &HeaderMap,
  tee: BodyTee,
  limit: usize,
) -> Option<u64> {
  if !is_json_content_type(response_headers) {
    return None;
  }

  if tee.overflowed() {
    tracing::warn!(
      url = %request.url,
      limit,
      "response body exceeds capture limit, skipping capture"
    );
    return None;
  }

  let encoding = response_headers
    .get(http::header::CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase());
  let decoded = match decode_body(encoding.as_deref(), tee.bytes(), limit) {
    Ok(Some(decoded)) => decoded,
    Ok(None) => {
      tracing::warn!(
        url = %request.url,
        limit,
        "decoded response body exceeds capture limit, skipping capture"
      );
      return None;
    }
    Err(e) => {
      tracing::warn!(url = %request.url, "failed to decode response body: {e}");
      return None;
    }
  };

  let body: serde_json::Value = match serde_json::from_slice(&decoded) {
    Ok(value) => value,
    Err(e) => {
      tracing::debug!(url = %request.url, "response is not valid JSON: {e}");
      return None;
    }
  };

  let size = decoded.len();
  let record = CaptureRecord {
    ordinal: 0,
    timestamp: now_rfc3339(),
    request: CapturedRequest {
      url: request.url.clone(),
      method: request.method.to_string(),
      headers: flatten_headers(&request.headers),
      body: request_body_value(&request.body),
    },
    response: CapturedResponse {
      status_code: status.as_u16(),
      headers: flatten_headers(response_headers),
      body,
    },
  };
  let ordinal = buffer.append(record);
  tracing::info!(
    "captured [{}] {} {} -> {} ({} bytes)",
    buffer.len(),
    request.method,
    request.url,
    status.as_u16(),
    size,
  );
  Some(ordinal)
}

/// Whether the response advertises a JSON payload. Any media type
/// containing `json` qualifies, e.g. `application/vnd.api+json`.
pub fn is_json_content_type(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("json"))
    .unwrap_or(false)
}

// Decoded output is bounded by reading at most limit + 1 bytes; Ok(None)
// means the decoded body outgrew the cap.
fn decode_body(
  encoding: Option<&str>,
  body: &[u8],
  limit: usize,
) -> std::io::Result<Option<Vec<u8>>> {
  let mut decoded = Vec::new();
  match encoding {
    None | Some("") | Some("identity") => return Ok(Some(body.to_vec())),
    Some("gzip") | Some("x-gzip") => {
      MultiGzDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)?;
    }
    Some("deflate") => {
      ZlibDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)?;
    }
    Some("br") => {
      Decompressor::new(body, 4096)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)?;
    }
    Some(other) => {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unsupported content-encoding: {other}"),
      ));
    }
  }
  if decoded.len() > limit {
    return Ok(None);
  }
  Ok(Some(decoded))
}

fn request_body_value(body: &Bytes) -> serde_json::Value {
  if body.is_empty() {
    return serde_json::Value::Null;
  }
  if let Ok(value) = serde_json::from_slice(body) {
    return value;
  }
  serde_json::Value::String(String::from_utf8_lossy(body).to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::CaptureBuffer;
  use flate2::write::{GzEncoder, ZlibEncoder};
  use flate2::Compression;
  use serde_json::json;
  use std::io::Write;

  fn request() -> RequestParts {
    RequestParts {
      method: Method::GET,
      url: "http://upstream.test/data".to_string(),
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  fn json_headers(extra: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    for (k, v) in extra {
      headers.insert(
        http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
        v.parse().unwrap(),
      );
    }
    headers
  }

  fn tee_of(body: &[u8], limit: usize) -> BodyTee {
    let mut tee = BodyTee::new(limit);
    tee.push(body);
    tee
  }

  #[test]
  fn plain_json_response_is_captured() {
    let buffer = CaptureBuffer::new(10);
    let ordinal = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[]),
      tee_of(br#"{"x":1}"#, MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    assert_eq!(ordinal, Some(1));
    let record = buffer.get(1).unwrap();
    assert_eq!(record.response.body, json!({"x": 1}));
    assert_eq!(record.response.status_code, 200);
    assert_eq!(record.request.url, "http://upstream.test/data");
  }

  #[test]
  fn gzip_response_round_trips_into_record() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(br#"{"a":[1,2,3]}"#).unwrap();
    let compressed = encoder.finish().unwrap();

    let buffer = CaptureBuffer::new(10);
    let headers = json_headers(&[("content-encoding", "gzip")]);
    let ordinal = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &headers,
      tee_of(&compressed, MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    assert!(ordinal.is_some());
    let record = buffer.get(1).unwrap();
    assert_eq!(record.response.body, json!({"a": [1, 2, 3]}));
    assert_eq!(record.response.headers["content-encoding"], "gzip");
  }

  #[test]
  fn deflate_and_brotli_responses_are_decoded() {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(br#"{"d":true}"#).unwrap();
    let deflated = encoder.finish().unwrap();

    let mut brotlied = Vec::new();
    {
      let mut writer = brotli::CompressorWriter::new(&mut brotlied, 4096, 5, 22);
      writer.write_all(br#"{"b":true}"#).unwrap();
    }

    let buffer = CaptureBuffer::new(10);
    finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[("content-encoding", "deflate")]),
      tee_of(&deflated, MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[("content-encoding", "br")]),
      tee_of(&brotlied, MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.get(1).unwrap().response.body, json!({"d": true}));
    assert_eq!(buffer.get(2).unwrap().response.body, json!({"b": true}));
  }

  #[test]
  fn non_json_content_type_is_not_captured() {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "text/html".parse().unwrap());
    let buffer = CaptureBuffer::new(10);
    let ordinal = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &headers,
      tee_of(br#"{"looks":"like json"}"#, MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    assert!(ordinal.is_none());
    assert!(buffer.is_empty());
  }

  #[test]
  fn json_content_type_with_garbage_body_is_skipped() {
    let buffer = CaptureBuffer::new(10);
    let ordinal = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[]),
      tee_of(b"<html>not json</html>", MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    assert!(ordinal.is_none());
    assert!(buffer.is_empty());
  }

  #[test]
  fn body_at_the_limit_is_captured_one_past_is_not() {
    // a JSON string body whose wire size lands exactly on the limit
    let limit = 64;
    let exact = format!("\"{}\"", "a".repeat(limit - 2));
    assert_eq!(exact.len(), limit);

    let buffer = CaptureBuffer::new(10);
    let at_limit = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[]),
      tee_of(exact.as_bytes(), limit),
      limit,
    );
    assert!(at_limit.is_some());

    let over = format!("\"{}\"", "a".repeat(limit - 1));
    let past_limit = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[]),
      tee_of(over.as_bytes(), limit),
      limit,
    );
    assert!(past_limit.is_none());
    assert_eq!(buffer.len(), 1);
  }

  #[test]
  fn decoded_size_over_the_limit_is_skipped() {
    // 40 bytes of JSON compress well under a 32-byte cap
    let limit = 32;
    let payload = format!("{{\"k\":\"{}\"}}", "b".repeat(30));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let buffer = CaptureBuffer::new(10);
    let ordinal = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[("content-encoding", "gzip")]),
      // the encoded bytes fit the tee, only the decoded form is too large
      tee_of(&compressed, 1024),
      limit,
    );
    assert!(ordinal.is_none());
  }

  #[test]
  fn corrupt_gzip_is_skipped_without_panic() {
    let buffer = CaptureBuffer::new(10);
    let ordinal = finish_response(
      &buffer,
      &request(),
      StatusCode::OK,
      &json_headers(&[("content-encoding", "gzip")]),
      tee_of(b"definitely not gzip", MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    assert!(ordinal.is_none());
  }

  #[test]
  fn json_request_body_round_trips() {
    let mut req = request();
    req.method = Method::POST;
    req.body = Bytes::from_static(br#"{"q":"users"}"#);
    let buffer = CaptureBuffer::new(10);
    finish_response(
      &buffer,
      &req,
      StatusCode::OK,
      &json_headers(&[]),
      tee_of(b"[]", MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    let record = buffer.get(1).unwrap();
    assert_eq!(record.request.body, json!({"q": "users"}));
  }

  #[test]
  fn text_request_body_is_kept_as_string() {
    let mut req = request();
    req.body = Bytes::from_static(b"plain text payload");
    let buffer = CaptureBuffer::new(10);
    finish_response(
      &buffer,
      &req,
      StatusCode::OK,
      &json_headers(&[]),
      tee_of(b"{}", MAX_CAPTURE_BODY),
      MAX_CAPTURE_BODY,
    );
    let record = buffer.get(1).unwrap();
    assert_eq!(record.request.body, json!("plain text payload"));
  }
}
