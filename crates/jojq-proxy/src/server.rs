//! Per-connection handlers
//!
//! Every accepted socket is classified by its first request line and then
//! served by one of three paths: plain HTTP forwarding, an opaque CONNECT
//! tunnel, or TLS-terminating interception. All three keep the client's
//! view of the exchange byte-identical to what upstream produced; capture
//! is a side channel.

use crate::ca::{CertificateManager, SniCertResolver};
use crate::capture::{self, RequestParts};
use crate::errors::{Error, Result};
use crate::http1::{self, BodyFraming, BodyTee, RequestHead};
use crate::proxy::ConnectionContext;
use bytes::Bytes;
use http::{Method, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Serve one accepted client connection.
pub(crate) async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  ctx: Arc<ConnectionContext>,
) -> Result<()> {
  let mut client = BufReader::new(stream);
  let Some(head) = http1::read_request_head(&mut client).await? else {
    return Ok(());
  };

  if head.method == Method::CONNECT {
    let (host, port) = parse_authority(&head.target)?;
    tracing::debug!(%peer, %host, port, "CONNECT");
    // The client waits for our 200 before speaking, so nothing useful is
    // buffered past the CONNECT head.
    let stream = client.into_inner();
    match ctx.certs.clone() {
      Some(certs) => handle_mitm(stream, &host, port, certs, &ctx).await,
      None => handle_tunnel(stream, &host, port, ctx.config.connect_timeout).await,
    }
  } else {
    handle_plain(&mut client, head, &ctx).await
  }
}

/// Plain HTTP: absolute-form requests forwarded upstream over cleartext.
async fn handle_plain<S>(
  client: &mut BufReader<S>,
  first: RequestHead,
  ctx: &ConnectionContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut next = Some(first);
  loop {
    let head = match next.take() {
      Some(head) => head,
      None => match http1::read_request_head(client).await? {
        Some(head) => head,
        None => return Ok(()),
      },
    };

    let uri: Uri = head
      .target
      .parse()
      .map_err(|_| Error::invalid_request(format!("unparseable request target: {}", head.target)))?;
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request("proxy requests must use an absolute URI"))?
      .to_string();
    let port = uri.port_u16().unwrap_or(80);
    let origin_target = uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .unwrap_or_else(|| "/".to_string());
    let host_header = if port == 80 {
      host.clone()
    } else {
      format!("{host}:{port}")
    };

    let body = http1::read_body(client, http1::request_body_framing(&head.headers)?).await?;

    let upstream = match connect_upstream(&host, port, ctx.config.connect_timeout).await {
      Ok(stream) => stream,
      Err(e) => {
        tracing::warn!(%host, port, "upstream connect failed: {e}");
        client.write_all(http1::BAD_GATEWAY).await?;
        client.flush().await?;
        return Ok(());
      }
    };

    let url = head.target.clone();
    let keep_alive = exchange(
      client,
      upstream,
      head,
      &origin_target,
      &host_header,
      url,
      body,
      ctx,
    )
    .await?;
    if !keep_alive {
      return Ok(());
    }
  }
}

/// Opaque CONNECT tunnel: no observation of the relayed bytes.
async fn handle_tunnel(
  mut client: TcpStream,
  host: &str,
  port: u16,
  connect_timeout: Duration,
) -> Result<()> {
  client.write_all(http1::CONNECTION_ESTABLISHED).await?;
  client.flush().await?;

  let mut upstream = match connect_upstream(host, port, connect_timeout).await {
    Ok(stream) => stream,
    Err(e) => {
      tracing::warn!(%host, port, "tunnel connect failed: {e}");
      return Ok(());
    }
  };

  let (mut client_read, mut client_write) = client.split();
  let (mut upstream_read, mut upstream_write) = upstream.split();
  tokio::select! {
    _ = tokio::io::copy(&mut client_read, &mut upstream_write) => {},
    _ = tokio::io::copy(&mut upstream_read, &mut client_write) => {},
  }
  Ok(())
}

/// TLS-terminating interception: decrypt the client side with a minted
/// leaf, re-encrypt upstream, and capture JSON exchanges in between.
async fn handle_mitm(
  mut client: TcpStream,
  host: &str,
  port: u16,
  certs: Arc<CertificateManager>,
  ctx: &ConnectionContext,
) -> Result<()> {
  client.write_all(http1::CONNECTION_ESTABLISHED).await?;
  client.flush().await?;

  let resolver = Arc::new(SniCertResolver::new(certs, host));
  let mut server_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_cert_resolver(resolver);
  server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
  let acceptor = TlsAcceptor::from(Arc::new(server_config));

  let tls = match acceptor.accept(client).await {
    Ok(tls) => tls,
    Err(e) => {
      tracing::warn!(%host, "client TLS handshake failed: {e}");
      return Ok(());
    }
  };
  let mut client = BufReader::new(tls);

  loop {
    let Some(head) = http1::read_request_head(&mut client).await? else {
      return Ok(());
    };
    let body = http1::read_body(&mut client, http1::request_body_framing(&head.headers)?).await?;

    // Fresh TLS session upstream for every request; the operator has
    // accepted the proxy as the trust boundary, so upstream certificates
    // are not verified.
    let upstream = match connect_upstream_tls(host, port, ctx).await {
      Ok(stream) => stream,
      Err(e) => {
        tracing::warn!(%host, port, "upstream TLS failed: {e}");
        client.write_all(http1::BAD_GATEWAY).await?;
        client.flush().await?;
        return Ok(());
      }
    };

    let host_header = if port == 443 {
      host.to_string()
    } else {
      format!("{host}:{port}")
    };
    let (origin_target, url) = if head.target.starts_with("http://") || head.target.starts_with("https://")
    {
      let absolute = head.target.clone();
      let origin = absolute
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str().to_string()))
        .unwrap_or_else(|| "/".to_string());
      (origin, absolute)
    } else {
      (
        head.target.clone(),
        format!("https://{}{}", host_header, head.target),
      )
    };

    let keep_alive = exchange(
      &mut client,
      upstream,
      head,
      &origin_target,
      &host_header,
      url,
      body,
      ctx,
    )
    .await?;
    if !keep_alive {
      return Ok(());
    }
  }
}

/// Forward one request over `upstream`, stream the response back to the
/// client, and finalize capture.
///
/// Returns whether the client connection may carry another request.
#[allow(clippy::too_many_arguments)]
async fn exchange<C, U>(
  client: &mut C,
  upstream: U,
  head: RequestHead,
  origin_target: &str,
  host_header: &str,
  url: String,
  body: Bytes,
  ctx: &ConnectionContext,
) -> Result<bool>
where
  C: AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let mut upstream = BufReader::new(upstream);
  let forwarded = http1::forward_headers(&head.headers, host_header, body.len());
  let raw = http1::encode_request(&head.method, origin_target, &forwarded, &body);
  upstream.write_all(&raw).await?;
  upstream.flush().await?;

  let response = match tokio::time::timeout(
    ctx.config.read_timeout,
    http1::read_response_head(&mut upstream),
  )
  .await
  {
    Ok(Ok(response)) => response,
    Ok(Err(e)) => {
      tracing::warn!(%url, "upstream read failed: {e}");
      client.write_all(http1::BAD_GATEWAY).await?;
      client.flush().await?;
      return Ok(false);
    }
    Err(_) => {
      tracing::warn!(%url, "upstream response timed out");
      client.write_all(http1::BAD_GATEWAY).await?;
      client.flush().await?;
      return Ok(false);
    }
  };

  // The head goes to the client exactly as received; capture must never
  // delay or alter the relay.
  client.write_all(&response.raw).await?;
  let framing = http1::response_body_framing(&head.method, response.status, &response.headers)?;
  // only JSON responses are worth accumulating
  let tee_cap = if capture::is_json_content_type(&response.headers) {
    ctx.config.max_capture_body
  } else {
    0
  };
  let mut tee = BodyTee::new(tee_cap);
  http1::relay_body(
    &mut upstream,
    client,
    framing,
    &mut tee,
    Some(ctx.config.read_timeout),
  )
  .await?;

  let request = RequestParts {
    method: head.method,
    url,
    headers: http1::capture_headers(&head.headers),
    body,
  };
  capture::finish_response(
    &ctx.buffer,
    &request,
    response.status,
    &response.headers,
    tee,
    ctx.config.max_capture_body,
  );

  let upstream_closed = matches!(framing, BodyFraming::Close)
    || response
      .headers
      .get(http::header::CONNECTION)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("close"))
      .unwrap_or(false);
  Ok(!upstream_closed)
}

async fn connect_upstream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
  let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
    .await
    .map_err(|_| Error::upstream(format!("connect to {host}:{port} timed out")))?
    .map_err(|e| Error::upstream(format!("failed to connect to {host}:{port}: {e}")))?;
  let _ = stream.set_nodelay(true);
  Ok(stream)
}

async fn connect_upstream_tls(
  host: &str,
  port: u16,
  ctx: &ConnectionContext,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
  let tcp = connect_upstream(host, port, ctx.config.connect_timeout).await?;
  let server_name = ServerName::try_from(host.to_string())
    .map_err(|_| Error::tls(format!("invalid upstream server name: {host}")))?;
  ctx
    .upstream_tls
    .connect(server_name, tcp)
    .await
    .map_err(|e| Error::tls(format!("TLS handshake with {host}:{port} failed: {e}")))
}

fn parse_authority(target: &str) -> Result<(String, u16)> {
  let (host, port) = match target.rsplit_once(':') {
    Some((host, port)) if !host.is_empty() && !port.contains(']') => {
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid CONNECT port: {port}")))?;
      (host, port)
    }
    _ => (target, 443),
  };
  Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

#[cfg(test)]
mod tests {
  use super::parse_authority;

  #[test]
  fn authority_with_port() {
    assert_eq!(
      parse_authority("upstream.test:8443").unwrap(),
      ("upstream.test".to_string(), 8443)
    );
  }

  #[test]
  fn authority_defaults_to_443() {
    assert_eq!(
      parse_authority("upstream.test").unwrap(),
      ("upstream.test".to_string(), 443)
    );
  }

  #[test]
  fn ipv6_authority_is_unbracketed() {
    assert_eq!(
      parse_authority("[::1]:8443").unwrap(),
      ("::1".to_string(), 8443)
    );
  }

  #[test]
  fn bad_port_is_rejected() {
    assert!(parse_authority("upstream.test:notaport").is_err());
  }
}
