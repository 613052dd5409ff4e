//! Error types for the interception proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Failed to bind the listener
  #[error("failed to bind {addr}: {reason}")]
  Bind {
    /// Listen address that could not be bound
    addr: String,
    /// Human-readable cause, e.g. address already in use
    reason: String,
  },

  /// Certificate error
  #[error("certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP error
  #[error(transparent)]
  Http(#[from] http::Error),

  /// JSON serialization error
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// Invalid request from the client
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream connection error
  #[error("upstream error: {0}")]
  Upstream(String),
}

impl Error {
  /// Create a certificate error
  pub fn certificate(msg: impl Into<String>) -> Self {
    Error::Certificate(msg.into())
  }

  /// Create a TLS error
  pub fn tls(msg: impl Into<String>) -> Self {
    Error::Tls(msg.into())
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  /// Create an upstream connection error
  pub fn upstream(msg: impl Into<String>) -> Self {
    Error::Upstream(msg.into())
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Certificate(value.to_string())
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::Tls(value.to_string())
  }
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}
