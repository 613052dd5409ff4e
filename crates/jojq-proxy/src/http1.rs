//! HTTP/1.1 wire plumbing
//!
//! Hand-rolled head parsing and body framing for both directions of the
//! proxy. Responses are relayed to the client chunk by chunk as they
//! arrive from upstream; a [`BodyTee`] collects a bounded copy of the
//! encoded body for the capture pipeline without delaying the relay.

use crate::errors::{new_io_error, Error, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Upper bound on a single request/status line.
const MAX_LINE: usize = 8192;
/// Upper bound on an entire head (start line + headers).
const MAX_HEAD: usize = 64 * 1024;
/// Relay buffer size.
const CHUNK: usize = 16 * 1024;

/// Parsed request line and headers.
#[derive(Debug)]
pub struct RequestHead {
  /// HTTP method
  pub method: Method,
  /// Request target exactly as sent (absolute-form for proxied plain
  /// HTTP, origin-form inside a MITM'd session, authority-form for
  /// CONNECT)
  pub target: String,
  /// HTTP version
  pub version: Version,
  /// Request headers
  pub headers: HeaderMap,
}

/// Parsed status line and headers, plus the raw head bytes for verbatim
/// forwarding.
#[derive(Debug)]
pub struct ResponseHead {
  /// Response status
  pub status: StatusCode,
  /// HTTP version
  pub version: Version,
  /// Response headers
  pub headers: HeaderMap,
  /// The exact bytes of the head including the terminating blank line
  pub raw: Vec<u8>,
}

/// How the message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// No body
  Empty,
  /// Exactly this many bytes follow
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Body runs until the peer closes the connection
  Close,
}

/// Read one request head from `reader`.
///
/// Returns `Ok(None)` on a clean EOF before any byte of a new request,
/// which is how keep-alive connections end.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  if reader.read_until(b'\n', &mut line).await? == 0 {
    return Ok(None);
  }
  if line.len() > MAX_LINE {
    return Err(Error::invalid_request("request line too long"));
  }

  let text = std::str::from_utf8(strip_crlf(&line))
    .map_err(|_| Error::invalid_request("request line is not valid UTF-8"))?;
  let parts: Vec<&str> = text.split_whitespace().collect();
  if parts.len() < 3 {
    return Err(Error::invalid_request(format!(
      "malformed request line: {text:?}"
    )));
  }
  let method = parts[0]
    .parse::<Method>()
    .map_err(|_| Error::invalid_request(format!("unknown method: {}", parts[0])))?;
  let version = parse_version(parts[2].as_bytes())?;
  let headers = read_headers(reader, None).await?;

  Ok(Some(RequestHead {
    method,
    target: parts[1].to_string(),
    version,
    headers,
  }))
}

/// Read one response head from `reader`, retaining the raw bytes.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let mut raw = Vec::new();
  if reader.read_until(b'\n', &mut raw).await? == 0 {
    return Err(Error::upstream("connection closed before response head"));
  }
  if raw.len() > MAX_LINE {
    return Err(Error::upstream("status line too long"));
  }

  let (version, status) = parse_status_line(strip_crlf(&raw))?;
  let headers = read_headers(reader, Some(&mut raw)).await?;

  Ok(ResponseHead {
    status,
    version,
    headers,
    raw,
  })
}

async fn read_headers<R>(reader: &mut R, mut raw: Option<&mut Vec<u8>>) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  let mut total = 0usize;
  loop {
    line.clear();
    let length = reader.read_until(b'\n', &mut line).await?;
    if let Some(raw) = raw.as_deref_mut() {
      raw.extend_from_slice(&line);
    }
    if length == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += length;
    if total > MAX_HEAD {
      return Err(Error::invalid_request("headers exceed maximum size"));
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&line) {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    }
  }
  Ok(headers)
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(&[10]).unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => return Err(Error::Http(http::Error::from(err))),
      },
      1 => match http::HeaderValue::from_bytes(h.trim_ascii()) {
        Ok(hv) => v = Some(hv),
        Err(err) => return Err(Error::Http(http::Error::from(err))),
      },
      _ => {}
    }
  }
  Ok((k, v))
}

fn parse_version(bytes: &[u8]) -> Result<Version> {
  let version = match bytes {
    b"HTTP/0.9" => Version::HTTP_09,
    b"HTTP/1.0" => Version::HTTP_10,
    b"HTTP/1.1" => Version::HTTP_11,
    b"HTTP/2.0" | b"HTTP/2" => Version::HTTP_2,
    b"HTTP/3.0" | b"HTTP/3" => Version::HTTP_3,
    _ => return Err(Error::invalid_request("invalid http version")),
  };
  Ok(version)
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let mut version = None;
  let mut status = None;
  for (index, vc) in line.splitn(3, |b| b == &b' ').enumerate() {
    match index {
      0 => version = Some(parse_version(vc)?),
      1 => {
        status = Some(
          StatusCode::try_from(vc)
            .map_err(|_| Error::upstream("invalid status code in response"))?,
        )
      }
      _ => {}
    }
  }
  match (version, status) {
    (Some(v), Some(s)) => Ok((v, s)),
    _ => Err(Error::upstream("malformed status line")),
  }
}

fn strip_crlf(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(&[10]).unwrap_or(line);
  line.strip_suffix(&[13]).unwrap_or(line)
}

/// Decide how a request body is framed.
pub fn request_body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
  if is_chunked(headers) {
    return Ok(BodyFraming::Chunked);
  }
  match content_length(headers)? {
    Some(0) | None => Ok(BodyFraming::Empty),
    Some(n) => Ok(BodyFraming::Length(n)),
  }
}

/// Decide how a response body is framed, per RFC 7230 §3.3.3.
pub fn response_body_framing(
  method: &Method,
  status: StatusCode,
  headers: &HeaderMap,
) -> Result<BodyFraming> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyFraming::Empty);
  }
  if is_chunked(headers) {
    return Ok(BodyFraming::Chunked);
  }
  match content_length(headers)? {
    Some(0) => Ok(BodyFraming::Empty),
    Some(n) => Ok(BodyFraming::Length(n)),
    None => Ok(BodyFraming::Close),
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Some)
      .ok_or_else(|| Error::invalid_request("bad content-length")),
  }
}

/// Read an entire body according to `framing`.
pub async fn read_body<R>(reader: &mut R, framing: BodyFraming) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match framing {
    BodyFraming::Empty => Ok(Bytes::new()),
    BodyFraming::Length(n) => {
      let mut body = vec![0u8; n as usize];
      reader.read_exact(&mut body).await?;
      Ok(Bytes::from(body))
    }
    BodyFraming::Chunked => Ok(Bytes::from(read_chunked_body(reader).await?)),
    BodyFraming::Close => {
      let mut body = Vec::new();
      reader.read_to_end(&mut body).await?;
      Ok(Bytes::from(body))
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    if reader.read_until(b'\n', &mut size_line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      ));
    }
    let size = parse_chunk_size(&size_line)?;
    if size == 0 {
      drain_trailers(reader, None::<&mut Vec<u8>>).await?;
      break;
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
  let text = std::str::from_utf8(strip_crlf(line))
    .map_err(|_| Error::invalid_request("bad chunk size"))?;
  let digits = text.split(';').next().unwrap_or("").trim();
  usize::from_str_radix(digits, 16).map_err(|_| Error::invalid_request("bad chunk size"))
}

async fn drain_trailers<R, W>(reader: &mut R, mut writer: Option<&mut W>) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if let Some(w) = writer.as_deref_mut() {
      w.write_all(&line).await?;
    }
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
  }
  Ok(())
}

/// Bounded copy of a relayed body.
///
/// Once the accumulated size would exceed the limit the tee stops copying
/// and discards what it held; the relay itself is unaffected.
#[derive(Debug)]
pub struct BodyTee {
  bytes: Vec<u8>,
  limit: usize,
  overflowed: bool,
}

impl BodyTee {
  /// Create a tee that holds at most `limit` bytes.
  pub fn new(limit: usize) -> Self {
    Self {
      bytes: Vec::new(),
      limit,
      overflowed: false,
    }
  }

  /// Record one relayed chunk.
  pub fn push(&mut self, chunk: &[u8]) {
    if self.overflowed {
      return;
    }
    if self.bytes.len() + chunk.len() > self.limit {
      self.overflowed = true;
      self.bytes = Vec::new();
      return;
    }
    self.bytes.extend_from_slice(chunk);
  }

  /// Whether the body outgrew the limit.
  pub fn overflowed(&self) -> bool {
    self.overflowed
  }

  /// Bytes collected so far.
  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  /// Consume the tee, yielding the collected bytes.
  pub fn into_bytes(self) -> Vec<u8> {
    self.bytes
  }
}

/// Relay a response body from `reader` to `writer` according to
/// `framing`, teeing each chunk into `tee`.
///
/// `read_timeout` bounds each read from upstream; the write side is the
/// client and is not bounded.
pub async fn relay_body<R, W>(
  reader: &mut R,
  writer: &mut W,
  framing: BodyFraming,
  tee: &mut BodyTee,
  read_timeout: Option<Duration>,
) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  match framing {
    BodyFraming::Empty => {}
    BodyFraming::Length(total) => {
      let mut remaining = total;
      let mut buf = vec![0u8; CHUNK];
      while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let n = timed(read_timeout, reader.read(&mut buf[..want])).await?;
        if n == 0 {
          return Err(new_io_error(
            std::io::ErrorKind::UnexpectedEof,
            "upstream closed mid-body",
          ));
        }
        writer.write_all(&buf[..n]).await?;
        tee.push(&buf[..n]);
        remaining -= n as u64;
      }
    }
    BodyFraming::Chunked => {
      loop {
        let mut size_line = Vec::new();
        if timed(read_timeout, reader.read_until(b'\n', &mut size_line)).await? == 0 {
          return Err(new_io_error(
            std::io::ErrorKind::UnexpectedEof,
            "upstream closed inside chunked body",
          ));
        }
        writer.write_all(&size_line).await?;
        let size = parse_chunk_size(&size_line)?;
        if size == 0 {
          drain_trailers(reader, Some(&mut *writer)).await?;
          break;
        }
        let mut chunk = vec![0u8; size];
        timed(read_timeout, reader.read_exact(&mut chunk)).await?;
        writer.write_all(&chunk).await?;
        tee.push(&chunk);
        let mut crlf = [0u8; 2];
        timed(read_timeout, reader.read_exact(&mut crlf)).await?;
        writer.write_all(&crlf).await?;
      }
    }
    BodyFraming::Close => {
      let mut buf = vec![0u8; CHUNK];
      loop {
        let n = timed(read_timeout, reader.read(&mut buf)).await?;
        if n == 0 {
          break;
        }
        writer.write_all(&buf[..n]).await?;
        tee.push(&buf[..n]);
      }
    }
  }
  writer.flush().await?;
  Ok(())
}

async fn timed<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match timeout {
    None => Ok(fut.await?),
    Some(t) => Ok(
      tokio::time::timeout(t, fut)
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, "upstream read timed out"))??,
    ),
  }
}

/// Headers that must not travel past this hop.
pub fn is_hop_header(name: &str) -> bool {
  matches!(
    name.to_ascii_lowercase().as_str(),
    "proxy-connection"
      | "proxy-authorization"
      | "proxy-authenticate"
      | "connection"
      | "keep-alive"
      | "te"
      | "trailer"
      | "upgrade"
  )
}

/// Build the header set for the upstream request: hop-by-hop and framing
/// headers stripped, `Host` guaranteed, body re-framed with an explicit
/// `Content-Length`. The upstream socket is one-shot and dropped after the
/// exchange, so no connection header is sent.
pub fn forward_headers(headers: &HeaderMap, host: &str, body_len: usize) -> HeaderMap {
  let mut forwarded = HeaderMap::new();
  for (name, value) in headers {
    if is_hop_header(name.as_str())
      || name == http::header::CONTENT_LENGTH
      || name == http::header::TRANSFER_ENCODING
    {
      continue;
    }
    forwarded.append(name.clone(), value.clone());
  }
  if !forwarded.contains_key(http::header::HOST) {
    if let Ok(value) = http::HeaderValue::from_str(host) {
      forwarded.insert(http::header::HOST, value);
    }
  }
  if body_len > 0 || headers.contains_key(http::header::CONTENT_LENGTH) {
    forwarded.insert(http::header::CONTENT_LENGTH, http::HeaderValue::from(body_len));
  }
  forwarded
}

/// Headers retained in the capture record: everything the client sent
/// minus proxy-only headers.
pub fn capture_headers(headers: &HeaderMap) -> HeaderMap {
  let mut kept = HeaderMap::new();
  for (name, value) in headers {
    if is_hop_header(name.as_str()) {
      continue;
    }
    kept.append(name.clone(), value.clone());
  }
  kept
}

/// Serialize a request head and body into wire bytes.
pub fn encode_request(method: &Method, target: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
  let mut raw = Vec::new();
  raw.extend(method.as_str().as_bytes());
  raw.extend(b" ");
  raw.extend(target.as_bytes());
  raw.extend(b" HTTP/1.1");
  raw.extend(CR_LF);
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(CR_LF);
  raw.extend(body);
  raw
}

/// The literal 502 reply sent when the upstream is unreachable.
pub const BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\n\r\nBad Gateway";

/// The literal reply confirming an established CONNECT tunnel.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_request_head_and_body() {
    let wire = b"POST http://api.test/v1 HTTP/1.1\r\nHost: api.test\r\nContent-Length: 4\r\n\r\nabcd";
    let mut reader = BufReader::new(&wire[..]);
    let head = read_request_head(&mut reader).await.unwrap().unwrap();
    assert_eq!(head.method, Method::POST);
    assert_eq!(head.target, "http://api.test/v1");
    assert_eq!(head.version, Version::HTTP_11);
    let framing = request_body_framing(&head.headers).unwrap();
    assert_eq!(framing, BodyFraming::Length(4));
    let body = read_body(&mut reader, framing).await.unwrap();
    assert_eq!(&body[..], b"abcd");
  }

  #[tokio::test]
  async fn eof_before_request_is_none() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(read_request_head(&mut reader).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn parses_response_head_with_raw_bytes() {
    let wire = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
    let mut reader = BufReader::new(&wire[..]);
    let head = read_response_head(&mut reader).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(
      head.headers.get(http::header::CONTENT_TYPE).unwrap(),
      "application/json"
    );
    assert!(head.raw.ends_with(b"\r\n\r\n"));
    assert!(head.raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
  }

  #[tokio::test]
  async fn decodes_chunked_bodies() {
    let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let body = read_body(&mut reader, BodyFraming::Chunked).await.unwrap();
    assert_eq!(&body[..], b"Wikipedia");
  }

  #[tokio::test]
  async fn relay_preserves_chunked_framing_and_tees_payload() {
    let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let mut out = Vec::new();
    let mut tee = BodyTee::new(1024);
    relay_body(&mut reader, &mut out, BodyFraming::Chunked, &mut tee, None)
      .await
      .unwrap();
    assert_eq!(out, wire.to_vec());
    assert_eq!(tee.bytes(), b"Wikipedia");
  }

  #[tokio::test]
  async fn relay_tee_overflow_does_not_break_relay() {
    let body = vec![b'x'; 100];
    let mut reader = BufReader::new(&body[..]);
    let mut out = Vec::new();
    let mut tee = BodyTee::new(10);
    relay_body(
      &mut reader,
      &mut out,
      BodyFraming::Length(100),
      &mut tee,
      None,
    )
    .await
    .unwrap();
    assert_eq!(out.len(), 100);
    assert!(tee.overflowed());
    assert!(tee.bytes().is_empty());
  }

  #[test]
  fn tee_holds_exactly_the_limit() {
    let mut tee = BodyTee::new(4);
    tee.push(b"ab");
    tee.push(b"cd");
    assert!(!tee.overflowed());
    assert_eq!(tee.bytes(), b"abcd");
    tee.push(b"e");
    assert!(tee.overflowed());
  }

  #[test]
  fn head_and_no_content_responses_have_no_body() {
    let headers = HeaderMap::new();
    assert_eq!(
      response_body_framing(&Method::HEAD, StatusCode::OK, &headers).unwrap(),
      BodyFraming::Empty
    );
    assert_eq!(
      response_body_framing(&Method::GET, StatusCode::NO_CONTENT, &headers).unwrap(),
      BodyFraming::Empty
    );
  }

  #[test]
  fn missing_length_means_read_to_close() {
    let headers = HeaderMap::new();
    assert_eq!(
      response_body_framing(&Method::GET, StatusCode::OK, &headers).unwrap(),
      BodyFraming::Close
    );
  }

  #[test]
  fn forward_headers_strips_hop_and_reframes_length() {
    let mut headers = HeaderMap::new();
    headers.insert("proxy-connection", "keep-alive".parse().unwrap());
    headers.insert("transfer-encoding", "chunked".parse().unwrap());
    headers.insert("accept", "application/json".parse().unwrap());
    let forwarded = forward_headers(&headers, "api.test", 11);
    assert!(forwarded.get("proxy-connection").is_none());
    assert!(forwarded.get("transfer-encoding").is_none());
    assert_eq!(forwarded.get("content-length").unwrap(), "11");
    assert_eq!(forwarded.get("host").unwrap(), "api.test");
    assert!(forwarded.get("connection").is_none());
    assert_eq!(forwarded.get("accept").unwrap(), "application/json");
  }

  #[test]
  fn encode_request_produces_wire_format() {
    let mut headers = HeaderMap::new();
    headers.insert("host", "api.test".parse().unwrap());
    let raw = encode_request(&Method::GET, "/v1", &headers, b"");
    assert_eq!(&raw[..], b"GET /v1 HTTP/1.1\r\nhost: api.test\r\n\r\n");
  }
}
