use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;
use volley_config::{EncryptDef, ServerTlsDef};
use volley_wire::{Encrypter, EncrypterRegistry, ServerTls, serve};

use crate::error::WorkerError;
use crate::server::WorkerServer;

/// A bound worker socket with its TLS and payload encryption resolved.
pub struct WorkerListener {
  listener: TcpListener,
  acceptor: Option<TlsAcceptor>,
  encrypter: Option<Arc<dyn Encrypter>>,
}

impl WorkerListener {
  pub async fn bind(
    address: &str,
    tls: Option<&ServerTlsDef>,
    encrypt: &EncryptDef,
    encrypters: &EncrypterRegistry,
  ) -> Result<Self, WorkerError> {
    let acceptor = tls
      .map(|tls| {
        ServerTls {
          cert: tls.cert.clone(),
          key: tls.key.clone(),
        }
        .acceptor()
      })
      .transpose()?;
    let encrypter = encrypters.resolve(encrypt)?;
    let listener = TcpListener::bind(address)
      .await
      .map_err(|source| WorkerError::Bind {
        address: address.to_string(),
        source,
      })?;
    Ok(Self {
      listener,
      acceptor,
      encrypter,
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr, WorkerError> {
    Ok(self.listener.local_addr().map_err(volley_wire::WireError::from)?)
  }

  /// Serve `server` until `cancel` fires, then close its connections.
  pub async fn run(self, server: Arc<WorkerServer>, cancel: CancellationToken) -> Result<(), WorkerError> {
    info!(
      tls = self.acceptor.is_some(),
      encrypted = self.encrypter.is_some(),
      connections = server.connection_count(),
      "worker_starting"
    );
    let result = serve(
      self.listener,
      self.acceptor,
      server.clone(),
      self.encrypter,
      cancel,
    )
    .await;
    server.shutdown();
    info!("worker_stopped");
    Ok(result?)
  }
}
