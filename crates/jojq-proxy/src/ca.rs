//! Certificate authority management for HTTPS interception
//!
//! Loads or generates a long-lived root CA on disk and mints short-lived
//! per-host leaf certificates on demand. Leaves are cached in memory and
//! handed to rustls through an SNI-aware certificate resolver.

use crate::errors::{Error, Result};
use crate::record::epoch_millis;
use moka::sync::Cache;
use rcgen::{
  CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;

/// CA certificate validity in whole days (10 years)
const CA_TTL_DAYS: i64 = 3650;
/// Leaf certificate validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Leaf cache bound; leaves were never evicted upstream of this bound
const LEAF_CACHE_CAPACITY: u64 = 1000;
/// Offset for not_before to tolerate client clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

/// Certificate authority that signs per-host leaf certificates.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA from `storage_path`, or generate and persist a new one.
  ///
  /// Partial on-disk state (one of the two PEM files missing) and
  /// unparseable material both trigger regeneration; the existing files
  /// are overwritten. Failure to create the storage directory is fatal.
  pub async fn ensure(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await.map_err(|e| {
        Error::certificate(format!(
          "cannot create CA directory {}: {}",
          storage_path.display(),
          e
        ))
      })?;
    }

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
      match Self::load(&cert_path, &key_path).await {
        Ok((issuer, ca_cert_der, ca_cert_pem)) => {
          tracing::debug!(path = %cert_path.display(), "loaded existing root CA");
          return Ok(Self {
            issuer,
            ca_cert_der,
            ca_cert_pem,
            storage_path,
          });
        }
        Err(e) => {
          tracing::warn!("stored CA is unusable ({e}), regenerating");
        }
      }
    } else if cert_path.exists() || key_path.exists() {
      tracing::warn!("incomplete CA material on disk, regenerating");
    }

    let (issuer, ca_cert_der, ca_cert_pem) = Self::generate(&cert_path, &key_path).await?;
    tracing::info!(path = %cert_path.display(), "generated new root CA");
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      storage_path,
    })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to parse CA certificate: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse CA PEM: {}", e)))?;

    Ok((issuer, cert_der, cert_pem))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "jojq Root CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DataEncipherment,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_TTL_DAYS);

    let key_pair = generate_key_pair()?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    write_atomic(cert_path, cert_pem.as_bytes()).await?;
    write_atomic(key_path, key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer: {}", e)))?;

    Ok((issuer, cert_der, cert_pem))
  }

  /// Sign a leaf certificate for `host` and package it for rustls.
  pub fn mint_leaf(&self, host: &str) -> Result<CertifiedKey> {
    let mut params = CertificateParams::default();
    params.serial_number = Some((epoch_millis() as u64).into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];

    // IP targets get an iPAddress SAN; some clients strictly check it.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid domain name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = generate_key_pair()?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.ca_cert_der.clone(),
    ];
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;
    let signing_key = any_supported_type(&key_der)
      .map_err(|e| Error::certificate(format!("unusable leaf key: {}", e)))?;

    Ok(CertifiedKey::new(chain, signing_key))
  }

  /// The root certificate in PEM form, for import into the client.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// On-disk location of the root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

/// Mints and caches per-host leaf certificates.
pub struct CertificateManager {
  ca: CertificateAuthority,
  leaf_cache: Cache<String, Arc<CertifiedKey>>,
}

impl CertificateManager {
  /// Create a manager backed by the CA stored (or generated) under
  /// `storage_path`.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::ensure(storage_path).await?;
    let leaf_cache = Cache::builder()
      .max_capacity(LEAF_CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs((LEAF_TTL_SECS / 2) as u64))
      .build();
    Ok(Self { ca, leaf_cache })
  }

  /// Return the cached leaf for `host`, minting one on first use.
  ///
  /// Hostnames are case-insensitive; `Example.COM` and `example.com`
  /// share a leaf. Concurrent mints for the same host may race, the last
  /// insert wins and both handshakes proceed.
  pub fn leaf_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
    let key = normalize_host(host);
    if let Some(cached) = self.leaf_cache.get(&key) {
      return Ok(cached);
    }
    let leaf = Arc::new(self.ca.mint_leaf(&key)?);
    self.leaf_cache.insert(key, leaf.clone());
    Ok(leaf)
  }

  /// The root certificate in PEM form.
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// On-disk location of the root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

/// rustls certificate resolver that mints leaves keyed on the handshake's
/// SNI name, falling back to the CONNECT-target host when the client sends
/// none.
pub struct SniCertResolver {
  manager: Arc<CertificateManager>,
  default_host: String,
}

impl SniCertResolver {
  /// Create a resolver with `default_host` as the no-SNI fallback.
  pub fn new(manager: Arc<CertificateManager>, default_host: impl Into<String>) -> Self {
    Self {
      manager,
      default_host: default_host.into(),
    }
  }
}

impl fmt::Debug for SniCertResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SniCertResolver")
      .field("default_host", &self.default_host)
      .finish()
  }
}

impl ResolvesServerCert for SniCertResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let host = client_hello
      .server_name()
      .unwrap_or(self.default_host.as_str());
    match self.manager.leaf_for(host) {
      Ok(leaf) => Some(leaf),
      Err(e) => {
        tracing::warn!(host, "failed to mint leaf certificate: {e}");
        None
      }
    }
  }
}

// RSA 2048 first for maximum client compatibility; the rcgen backend may
// only support ECDSA generation, in which case fall back to its default
// P-256 key.
fn generate_key_pair() -> Result<KeyPair> {
  KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
    .or_else(|_| KeyPair::generate())
    .map_err(|e| Error::certificate(format!("failed to generate key pair: {}", e)))
}

fn normalize_host(host: &str) -> String {
  match host.parse::<IpAddr>() {
    Ok(_) => host.to_string(),
    Err(_) => host.to_ascii_lowercase(),
  }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
  let tmp = path.with_extension("pem.tmp");
  fs::write(&tmp, contents).await?;
  fs::rename(&tmp, path).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::normalize_host;

  #[test]
  fn hostnames_normalize_case_insensitively() {
    assert_eq!(normalize_host("Example.COM"), "example.com");
    assert_eq!(normalize_host("example.com"), "example.com");
  }

  #[test]
  fn ip_literals_are_left_alone() {
    assert_eq!(normalize_host("127.0.0.1"), "127.0.0.1");
    assert_eq!(normalize_host("::1"), "::1");
  }
}
