//! TLS for the worker connection: CA-verified or skip-verify clients, PEM
//! file servers.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::WireError;

#[derive(Debug, Clone, Default)]
pub struct ClientTls {
  pub ca_cert: Option<PathBuf>,
  pub server_name_override: Option<String>,
  pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct ServerTls {
  pub cert: PathBuf,
  pub key: PathBuf,
}

fn provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> WireError {
  WireError::Tls(e.to_string())
}

fn open(path: &Path) -> Result<BufReader<File>, WireError> {
  File::open(path)
    .map(BufReader::new)
    .map_err(|e| WireError::Tls(format!("{}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, WireError> {
  let certs = rustls_pemfile::certs(&mut open(path)?)
    .collect::<Result<Vec<_>, _>>()
    .map_err(tls_error)?;
  if certs.is_empty() {
    return Err(WireError::Tls(format!("no certificates in {}", path.display())));
  }
  Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, WireError> {
  rustls_pemfile::private_key(&mut open(path)?)
    .map_err(tls_error)?
    .ok_or_else(|| WireError::Tls(format!("no private key in {}", path.display())))
}

impl ClientTls {
  /// Build a connector and the name presented for verification.
  ///
  /// The name defaults to the host part of `address`.
  pub fn connector(&self, address: &str) -> Result<(TlsConnector, ServerName<'static>), WireError> {
    let builder = ClientConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()
      .map_err(tls_error)?;

    let config = if self.insecure_skip_verify {
      builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipVerification(provider())))
        .with_no_client_auth()
    } else {
      let ca_path = self
        .ca_cert
        .as_deref()
        .ok_or_else(|| WireError::Tls("ca_cert is required unless insecure_skip_verify is set".into()))?;
      let mut roots = RootCertStore::empty();
      for cert in load_certs(ca_path)? {
        roots.add(cert).map_err(tls_error)?;
      }
      builder.with_root_certificates(roots).with_no_client_auth()
    };

    let name = match &self.server_name_override {
      Some(name) => name.clone(),
      None => host_of(address).to_string(),
    };
    let server_name = ServerName::try_from(name).map_err(tls_error)?;
    Ok((TlsConnector::from(Arc::new(config)), server_name))
  }
}

impl ServerTls {
  pub fn acceptor(&self) -> Result<TlsAcceptor, WireError> {
    let config = ServerConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()
      .map_err(tls_error)?
      .with_no_client_auth()
      .with_single_cert(load_certs(&self.cert)?, load_key(&self.key)?)
      .map_err(tls_error)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
  }
}

fn host_of(address: &str) -> &str {
  let host = match address.rsplit_once(':') {
    Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
    _ => address,
  };
  host.trim_start_matches('[').trim_end_matches(']')
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct SkipVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.0.signature_verification_algorithms.supported_schemes()
  }
}
