//! Interception proxy core for jojq
//!
//! jojq sits between an API client and the network, forwards every
//! request upstream, and keeps a structured copy of each JSON response in
//! a bounded in-memory buffer for offline inspection.
//!
//! Plain HTTP requests are forwarded over cleartext. For HTTPS the proxy
//! either tunnels `CONNECT` traffic opaquely or, when interception is
//! enabled, terminates TLS with a per-host leaf certificate minted by its
//! own root CA and opens a fresh TLS session upstream.
//!
//! # Example
//!
//! ```no_run
//! use jojq_proxy::{Proxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = ProxyConfig {
//!     mitm: true,
//!     ..Default::default()
//!   };
//!   let proxy = Proxy::bind(config).await?;
//!   proxy.run().await?;
//!   Ok(())
//! }
//! ```

mod buffer;
mod ca;
mod capture;
mod errors;
mod http1;
mod proxy;
mod record;
mod server;

pub use buffer::{CaptureBuffer, DEFAULT_CAPACITY};
pub use ca::{CertificateAuthority, CertificateManager, SniCertResolver};
pub use capture::MAX_CAPTURE_BODY;
pub use errors::{Error, Result};
pub use proxy::{Proxy, ProxyConfig, DEFAULT_PORT};
pub use record::{
  export_file_name, export_record, export_records, CaptureRecord, CapturedRequest,
  CapturedResponse,
};
