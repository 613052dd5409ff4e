//! Proxy configuration and accept loop

use crate::buffer::CaptureBuffer;
use crate::ca::CertificateManager;
use crate::capture::MAX_CAPTURE_BODY;
use crate::errors::{Error, Result};
use crate::server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Default proxy port.
pub const DEFAULT_PORT: u16 = 8888;

/// Configuration for the interception proxy.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Port to listen on (`0` picks an ephemeral port)
  pub port: u16,
  /// Decrypt HTTPS traffic instead of tunneling it opaquely
  pub mitm: bool,
  /// Directory holding the root CA key and certificate
  pub ca_dir: PathBuf,
  /// Maximum number of retained captures
  pub max_captures: usize,
  /// Cap on the decoded response body considered for capture
  pub max_capture_body: usize,
  /// Bound on upstream TCP connects
  pub connect_timeout: Duration,
  /// Bound on each upstream read
  pub read_timeout: Duration,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      port: DEFAULT_PORT,
      mitm: false,
      ca_dir: PathBuf::from(".jojq"),
      max_captures: crate::buffer::DEFAULT_CAPACITY,
      max_capture_body: MAX_CAPTURE_BODY,
      connect_timeout: Duration::from_secs(10),
      read_timeout: Duration::from_secs(30),
    }
  }
}

/// Shared state handed to every connection handler.
pub(crate) struct ConnectionContext {
  pub config: ProxyConfig,
  pub buffer: Arc<CaptureBuffer>,
  pub certs: Option<Arc<CertificateManager>>,
  pub upstream_tls: TlsConnector,
}

/// The interception proxy: owns the listener, the capture buffer and,
/// in MITM mode, the certificate manager.
pub struct Proxy {
  listener: TcpListener,
  local_addr: SocketAddr,
  ctx: Arc<ConnectionContext>,
  shutdown: Arc<Notify>,
}

impl Proxy {
  /// Bind the listener and prepare shared state.
  ///
  /// In MITM mode this also loads or generates the root CA, which is the
  /// other startup step that can fail fatally.
  pub async fn bind(config: ProxyConfig) -> Result<Self> {
    let certs = if config.mitm {
      Some(Arc::new(CertificateManager::new(&config.ca_dir).await?))
    } else {
      None
    };

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
      let reason = if e.kind() == std::io::ErrorKind::AddrInUse {
        format!("address already in use, is another proxy on port {}?", config.port)
      } else {
        e.to_string()
      };
      Error::Bind { addr, reason }
    })?;
    let local_addr = listener.local_addr()?;

    let tls_config = ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    let upstream_tls = TlsConnector::from(Arc::new(tls_config));

    let buffer = Arc::new(CaptureBuffer::new(config.max_captures));
    Ok(Self {
      listener,
      local_addr,
      ctx: Arc::new(ConnectionContext {
        config,
        buffer,
        certs,
        upstream_tls,
      }),
      shutdown: Arc::new(Notify::new()),
    })
  }

  /// Address the listener is bound to.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Shared capture buffer.
  pub fn buffer(&self) -> Arc<CaptureBuffer> {
    self.ctx.buffer.clone()
  }

  /// Handle that stops the accept loop when notified.
  pub fn shutdown_handle(&self) -> Arc<Notify> {
    self.shutdown.clone()
  }

  /// Location of the root certificate, when MITM mode is active.
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.ctx.certs.as_ref().map(|c| c.ca_cert_path())
  }

  /// Accept connections until shut down.
  ///
  /// Each accepted socket is served on its own task; the acceptor never
  /// waits for handlers. Accept errors are fatal, per-connection errors
  /// only close that connection.
  pub async fn run(self) -> Result<()> {
    tracing::info!(
      addr = %self.local_addr,
      mitm = self.ctx.certs.is_some(),
      "proxy listening"
    );
    loop {
      tokio::select! {
        _ = self.shutdown.notified() => {
          tracing::info!("proxy listener closed");
          return Ok(());
        }
        accepted = self.listener.accept() => {
          let (stream, peer) = accepted?;
          let ctx = self.ctx.clone();
          tokio::spawn(async move {
            if let Err(e) = server::handle_connection(stream, peer, ctx).await {
              tracing::debug!(%peer, "connection closed with error: {e}");
            }
          });
        }
      }
    }
  }
}

/// Accepts any upstream certificate. The operator opted into
/// interception; the proxy is the trust boundary, not the upstream chain.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
