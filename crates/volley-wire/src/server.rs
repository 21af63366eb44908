//! Serving side of a connection: decode calls and hand them to a
//! [`WorkerService`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::encrypt::{Encrypter, Payload};
use crate::error::WireError;
use crate::frame::{Frame, FrameCodec, FrameKind};
use crate::message::*;

/// Error returned by a service method; its message travels to the caller.
pub struct Status {
  message: String,
}

impl Status {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

impl<E: std::error::Error> From<E> for Status {
  fn from(error: E) -> Self {
    Self::new(error.to_string())
  }
}

impl fmt::Debug for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Status").field("message", &self.message).finish()
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

/// The worker RPC surface.
///
/// Unary methods that may block receive the call's cancellation token; it
/// fires when the caller abandons the call or the connection drops.
#[async_trait]
pub trait WorkerService: Send + Sync {
  async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, Status>;

  async fn disconnect(&self, request: DisconnectRequest) -> Result<Ack, Status>;

  async fn slave_command(
    &self,
    request: SlaveCommandRequest,
    cancel: CancellationToken,
  ) -> Result<SlaveCommandResponse, Status>;

  async fn slave_command_default_store(
    &self,
    stream: RequestStream<SlaveCommandDefaultStoreRequest>,
  ) -> Result<Ack, Status>;

  async fn call_exec(
    &self,
    request: CallExecRequest,
    sink: ResponseSink<CallExecResponse>,
  ) -> Result<(), Status>;

  async fn receive_chanel_connect(
    &self,
    request: ReceiveChanelConnectRequest,
    sink: ResponseSink<ReceiveChanelConnectResponse>,
  ) -> Result<(), Status>;

  async fn send_loader(&self, stream: RequestStream<SendLoaderRequest>) -> Result<Ack, Status>;

  async fn send_auth(&self, request: SendAuthRequest) -> Result<Ack, Status>;

  async fn send_store_data(&self, stream: RequestStream<SendStoreDataRequest>)
  -> Result<Ack, Status>;

  async fn send_store_ok(&self, request: SendStoreOkRequest) -> Result<Ack, Status>;

  async fn send_target(&self, request: SendTargetRequest) -> Result<Ack, Status>;

  async fn receive_load_term_channel(
    &self,
    request: ReceiveLoadTermChannelRequest,
    cancel: CancellationToken,
  ) -> Result<ReceiveLoadTermChannelResponse, Status>;
}

/// Incoming messages of a client-streaming call.
pub struct RequestStream<T> {
  inbound: mpsc::UnboundedReceiver<Vec<u8>>,
  payload: Payload,
  cancel: CancellationToken,
  _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RequestStream<T> {
  /// Next message, `None` once the caller finished sending.
  pub async fn message(&mut self) -> Result<Option<T>, WireError> {
    let next = tokio::select! {
      _ = self.cancel.cancelled() => return Err(WireError::Cancelled),
      next = self.inbound.recv() => next,
    };
    match next {
      Some(bytes) => self.payload.decode(&bytes).map(Some),
      None => Ok(None),
    }
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }
}

/// Outgoing messages of a server-streaming call.
pub struct ResponseSink<T> {
  call_id: u64,
  outbound: mpsc::UnboundedSender<Frame>,
  payload: Payload,
  cancel: CancellationToken,
  connection: CancellationToken,
  _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> ResponseSink<T> {
  pub fn send(&self, message: &T) -> Result<(), WireError> {
    if self.cancel.is_cancelled() {
      return Err(WireError::Cancelled);
    }
    let bytes = self.payload.encode(message)?;
    self
      .outbound
      .send(Frame {
        call_id: self.call_id,
        kind: FrameKind::Message(bytes),
      })
      .map_err(|_| WireError::ConnectionClosed)
  }

  /// Fires when the caller goes away.
  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Fires only when the whole connection closes, not when the caller
  /// abandons this one call.
  pub fn connection_token(&self) -> &CancellationToken {
    &self.connection
  }
}

struct CallEntry {
  inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
  cancel: CancellationToken,
}

struct ServerCall {
  id: u64,
  inbound: mpsc::UnboundedReceiver<Vec<u8>>,
  outbound: mpsc::UnboundedSender<Frame>,
  payload: Payload,
  cancel: CancellationToken,
  connection: CancellationToken,
}

impl ServerCall {
  async fn request<T: DeserializeOwned>(&mut self) -> Result<T, Status> {
    let bytes = tokio::select! {
      _ = self.cancel.cancelled() => return Err(WireError::Cancelled.into()),
      bytes = self.inbound.recv() => bytes,
    };
    let bytes = bytes.ok_or_else(|| Status::new("request message missing"))?;
    Ok(self.payload.decode(&bytes)?)
  }

  fn respond<T: Serialize>(&self, message: &T) -> Result<(), Status> {
    let bytes = self.payload.encode(message)?;
    self
      .outbound
      .send(Frame {
        call_id: self.id,
        kind: FrameKind::Message(bytes),
      })
      .map_err(|_| WireError::ConnectionClosed.into())
  }

  fn stream<T>(self) -> RequestStream<T> {
    RequestStream {
      inbound: self.inbound,
      payload: self.payload,
      cancel: self.cancel,
      _marker: PhantomData,
    }
  }

  fn sink<T>(&self) -> ResponseSink<T> {
    ResponseSink {
      call_id: self.id,
      outbound: self.outbound.clone(),
      payload: self.payload.clone(),
      cancel: self.cancel.clone(),
      connection: self.connection.clone(),
      _marker: PhantomData,
    }
  }
}

async fn dispatch<S>(service: &S, method: Method, mut call: ServerCall) -> Result<(), Status>
where
  S: WorkerService + ?Sized,
{
  match method {
    Method::Connect => {
      let request = call.request().await?;
      let response = service.connect(request).await?;
      call.respond(&response)
    }
    Method::Disconnect => {
      let request = call.request().await?;
      let response = service.disconnect(request).await?;
      call.respond(&response)
    }
    Method::SlaveCommand => {
      let request = call.request().await?;
      let response = service.slave_command(request, call.cancel.clone()).await?;
      call.respond(&response)
    }
    Method::SlaveCommandDefaultStore => {
      let responder = call.sink::<Ack>();
      let response = service.slave_command_default_store(call.stream()).await?;
      responder.send(&response).map_err(Status::from)
    }
    Method::CallExec => {
      let request = call.request().await?;
      service.call_exec(request, call.sink()).await
    }
    Method::ReceiveChanelConnect => {
      let request = call.request().await?;
      service.receive_chanel_connect(request, call.sink()).await
    }
    Method::SendLoader => {
      let responder = call.sink::<Ack>();
      let response = service.send_loader(call.stream()).await?;
      responder.send(&response).map_err(Status::from)
    }
    Method::SendAuth => {
      let request = call.request().await?;
      let response = service.send_auth(request).await?;
      call.respond(&response)
    }
    Method::SendStoreData => {
      let responder = call.sink::<Ack>();
      let response = service.send_store_data(call.stream()).await?;
      responder.send(&response).map_err(Status::from)
    }
    Method::SendStoreOk => {
      let request = call.request().await?;
      let response = service.send_store_ok(request).await?;
      call.respond(&response)
    }
    Method::SendTarget => {
      let request = call.request().await?;
      let response = service.send_target(request).await?;
      call.respond(&response)
    }
    Method::ReceiveLoadTermChannel => {
      let request = call.request().await?;
      let response = service
        .receive_load_term_channel(request, call.cancel.clone())
        .await?;
      call.respond(&response)
    }
  }
}

/// Serve calls arriving on one connection until it closes or `cancel` fires.
pub async fn serve_connection<IO, S>(
  io: IO,
  service: Arc<S>,
  encrypter: Option<Arc<dyn Encrypter>>,
  cancel: CancellationToken,
) where
  IO: AsyncRead + AsyncWrite + Send + 'static,
  S: WorkerService + ?Sized + 'static,
{
  let (mut sink, mut stream) = Framed::new(io, FrameCodec::new()).split();
  let (outbound, mut queued) = mpsc::unbounded_channel::<Frame>();
  let calls: Arc<DashMap<u64, CallEntry>> = Arc::new(DashMap::new());
  let payload = Payload::new(encrypter);
  let connection = cancel.child_token();

  let writer_cancel = connection.clone();
  let writer = tokio::spawn(async move {
    loop {
      let frame = tokio::select! {
        biased;
        _ = writer_cancel.cancelled() => break,
        frame = queued.recv() => frame,
      };
      let Some(frame) = frame else { break };
      if let Err(e) = sink.send(frame).await {
        debug!(error = %e, "connection_write_failed");
        writer_cancel.cancel();
        break;
      }
    }
    let _ = sink.close().await;
  });

  loop {
    let next = tokio::select! {
      biased;
      _ = connection.cancelled() => break,
      next = stream.next() => next,
    };
    let frame = match next {
      Some(Ok(frame)) => frame,
      Some(Err(e)) => {
        debug!(error = %e, "connection_read_failed");
        break;
      }
      None => break,
    };

    let call_id = frame.call_id;
    match frame.kind {
      FrameKind::Open(method) => {
        let (sender, inbound) = mpsc::unbounded_channel();
        let call_cancel = connection.child_token();
        calls.insert(
          call_id,
          CallEntry {
            inbound: Some(sender),
            cancel: call_cancel.clone(),
          },
        );
        let call = ServerCall {
          id: call_id,
          inbound,
          outbound: outbound.clone(),
          payload: payload.clone(),
          cancel: call_cancel,
          connection: connection.clone(),
        };
        let service = service.clone();
        let calls = calls.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
          trace!(call_id, method = method.name(), "call_started");
          let result = dispatch(service.as_ref(), method, call).await;
          let error = match result {
            Ok(()) => None,
            Err(status) => {
              debug!(call_id, method = method.name(), error = %status, "call_failed");
              Some(status.message)
            }
          };
          calls.remove(&call_id);
          let _ = outbound.send(Frame {
            call_id,
            kind: FrameKind::End(error),
          });
        });
      }
      FrameKind::Message(bytes) => {
        if let Some(entry) = calls.get(&call_id) {
          if let Some(sender) = &entry.inbound {
            let _ = sender.send(bytes);
          }
        }
      }
      FrameKind::HalfClose => {
        if let Some(mut entry) = calls.get_mut(&call_id) {
          entry.inbound = None;
        }
      }
      FrameKind::Cancel => {
        if let Some((_, entry)) = calls.remove(&call_id) {
          entry.cancel.cancel();
        }
      }
      FrameKind::End(_) => trace!(call_id, "unexpected_end_ignored"),
    }
  }

  connection.cancel();
  calls.clear();
  let _ = writer.await;
}

/// Accept connections until `cancel` fires.
#[instrument(name = "worker_listener", skip_all, fields(address = ?listener.local_addr().ok()))]
pub async fn serve<S>(
  listener: TcpListener,
  acceptor: Option<TlsAcceptor>,
  service: Arc<S>,
  encrypter: Option<Arc<dyn Encrypter>>,
  cancel: CancellationToken,
) -> Result<(), WireError>
where
  S: WorkerService + ?Sized + 'static,
{
  info!("listener_started");
  let mut failures = 0;
  loop {
    let accepted = tokio::select! {
      _ = cancel.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    let (tcp, peer) = match accepted {
      Ok(accepted) => {
        failures = 0;
        accepted
      }
      Err(e) => {
        let delay = accept_backoff(failures);
        failures = failures.saturating_add(1);
        warn!(error = %e, failures, retry_in_ms = delay.as_millis() as u64, "accept_failed");
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(delay) => continue,
        }
      }
    };
    let _ = tcp.set_nodelay(true);
    debug!(%peer, "connection_accepted");

    let acceptor = acceptor.clone();
    let service = service.clone();
    let encrypter = encrypter.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
      match acceptor {
        Some(acceptor) => match acceptor.accept(tcp).await {
          Ok(tls) => serve_connection(tls, service, encrypter, cancel).await,
          Err(e) => warn!(%peer, error = %e, "tls_handshake_failed"),
        },
        None => serve_connection(tcp, service, encrypter, cancel).await,
      }
      debug!(%peer, "connection_closed");
    });
  }
  info!("listener_stopped");
  Ok(())
}

/// Pause before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
  const MAX: Duration = Duration::from_secs(1);
  Duration::from_millis(5)
    .saturating_mul(1 << failures.min(10))
    .min(MAX)
}
