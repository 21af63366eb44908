//! Dialing side of a connection: many concurrent calls over one stream.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::encrypt::{Encrypter, Payload};
use crate::error::WireError;
use crate::frame::{Frame, FrameCodec, FrameKind};
use crate::message::Method;
use crate::tls::ClientTls;

enum Inbound {
  Message(Vec<u8>),
  End(Option<String>),
  Closed,
}

type CallTable = DashMap<u64, mpsc::UnboundedSender<Inbound>>;

/// A multiplexed client connection. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
  inner: Arc<ChannelInner>,
}

struct ChannelInner {
  outbound: mpsc::UnboundedSender<Frame>,
  calls: Arc<CallTable>,
  next_call: AtomicU64,
  payload: Payload,
  closed: CancellationToken,
}

impl Drop for ChannelInner {
  fn drop(&mut self) {
    self.closed.cancel();
  }
}

impl Channel {
  /// Dial `address`, optionally over TLS.
  pub async fn dial(
    address: &str,
    tls: Option<&ClientTls>,
    encrypter: Option<Arc<dyn Encrypter>>,
  ) -> Result<Self, WireError> {
    let tcp = TcpStream::connect(address).await?;
    tcp.set_nodelay(true)?;
    match tls {
      Some(tls) => {
        let (connector, server_name) = tls.connector(address)?;
        let stream = connector.connect(server_name, tcp).await?;
        Ok(Self::new(stream, encrypter))
      }
      None => Ok(Self::new(tcp, encrypter)),
    }
  }

  /// Run the protocol over an established byte stream.
  pub fn new<IO>(io: IO, encrypter: Option<Arc<dyn Encrypter>>) -> Self
  where
    IO: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (mut sink, mut stream) = Framed::new(io, FrameCodec::new()).split();
    let (outbound, mut queued) = mpsc::unbounded_channel::<Frame>();
    let calls: Arc<CallTable> = Arc::new(DashMap::new());
    let closed = CancellationToken::new();

    let writer_closed = closed.clone();
    tokio::spawn(async move {
      loop {
        let frame = tokio::select! {
          biased;
          _ = writer_closed.cancelled() => break,
          frame = queued.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
          debug!(error = %e, "channel_write_failed");
          writer_closed.cancel();
          break;
        }
      }
      let _ = sink.close().await;
    });

    let reader_calls = calls.clone();
    let reader_closed = closed.clone();
    tokio::spawn(async move {
      loop {
        let next = tokio::select! {
          biased;
          _ = reader_closed.cancelled() => break,
          next = stream.next() => next,
        };
        match next {
          Some(Ok(frame)) => route(&reader_calls, frame),
          Some(Err(e)) => {
            debug!(error = %e, "channel_read_failed");
            break;
          }
          None => break,
        }
      }
      reader_closed.cancel();
      let pending: Vec<u64> = reader_calls.iter().map(|entry| *entry.key()).collect();
      for call_id in pending {
        if let Some((_, sender)) = reader_calls.remove(&call_id) {
          let _ = sender.send(Inbound::Closed);
        }
      }
    });

    Self {
      inner: Arc::new(ChannelInner {
        outbound,
        calls,
        next_call: AtomicU64::new(1),
        payload: Payload::new(encrypter),
        closed,
      }),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.is_cancelled()
  }

  /// Resolves once the connection is gone.
  pub async fn closed(&self) {
    self.inner.closed.cancelled().await
  }

  /// Tear the connection down. Outstanding calls fail with
  /// [`WireError::ConnectionClosed`].
  pub fn close(&self) {
    self.inner.closed.cancel();
  }

  fn open(&self, method: Method) -> Result<Call, WireError> {
    let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
    let (sender, inbound) = mpsc::unbounded_channel();
    self.inner.calls.insert(id, sender);
    // The reader drains the table after cancelling, so a call registered
    // before this check is always either drained or rejected here.
    if self.is_closed() {
      self.inner.calls.remove(&id);
      return Err(WireError::ConnectionClosed);
    }

    let call = Call {
      id,
      method,
      channel: self.clone(),
      inbound,
      finished: false,
    };
    call.send_frame(FrameKind::Open(method))?;
    trace!(call_id = id, method = method.name(), "call_opened");
    Ok(call)
  }

  pub async fn unary<Req, Resp>(&self, method: Method, request: &Req) -> Result<Resp, WireError>
  where
    Req: Serialize,
    Resp: DeserializeOwned,
  {
    let mut call = self.open(method)?;
    call.send(request)?;
    call.send_frame(FrameKind::HalfClose)?;
    let response = call
      .recv_raw()
      .await?
      .ok_or(WireError::MissingResponse {
        method: method.name(),
      })?;
    call.drain().await?;
    self.inner.payload.decode(&response)
  }

  pub fn client_streaming<Req, Resp>(
    &self,
    method: Method,
  ) -> Result<ClientStreaming<Req, Resp>, WireError> {
    Ok(ClientStreaming {
      call: self.open(method)?,
      _marker: PhantomData,
    })
  }

  pub fn server_streaming<Req, Resp>(
    &self,
    method: Method,
    request: &Req,
  ) -> Result<ServerStreaming<Resp>, WireError>
  where
    Req: Serialize,
  {
    let call = self.open(method)?;
    call.send(request)?;
    call.send_frame(FrameKind::HalfClose)?;
    Ok(ServerStreaming {
      call,
      _marker: PhantomData,
    })
  }
}

fn route(calls: &CallTable, frame: Frame) {
  match frame.kind {
    FrameKind::Message(bytes) => {
      if let Some(sender) = calls.get(&frame.call_id) {
        let _ = sender.send(Inbound::Message(bytes));
      }
    }
    FrameKind::End(error) => {
      if let Some((_, sender)) = calls.remove(&frame.call_id) {
        let _ = sender.send(Inbound::End(error));
      }
    }
    other => trace!(call_id = frame.call_id, frame = ?other, "unexpected_frame_ignored"),
  }
}

/// One in-flight call. Dropping an unfinished call cancels it remotely.
struct Call {
  id: u64,
  method: Method,
  channel: Channel,
  inbound: mpsc::UnboundedReceiver<Inbound>,
  finished: bool,
}

impl Call {
  fn send_frame(&self, kind: FrameKind) -> Result<(), WireError> {
    self
      .channel
      .inner
      .outbound
      .send(Frame {
        call_id: self.id,
        kind,
      })
      .map_err(|_| WireError::ConnectionClosed)
  }

  fn send<T: Serialize>(&self, message: &T) -> Result<(), WireError> {
    let bytes = self.channel.inner.payload.encode(message)?;
    self.send_frame(FrameKind::Message(bytes))
  }

  /// Next payload, `None` on a clean end.
  async fn recv_raw(&mut self) -> Result<Option<Vec<u8>>, WireError> {
    match self.inbound.recv().await {
      Some(Inbound::Message(bytes)) => Ok(Some(bytes)),
      Some(Inbound::End(None)) => {
        self.finished = true;
        Ok(None)
      }
      Some(Inbound::End(Some(message))) => {
        self.finished = true;
        Err(WireError::Remote {
          method: self.method.name(),
          message,
        })
      }
      Some(Inbound::Closed) | None => {
        self.finished = true;
        Err(WireError::ConnectionClosed)
      }
    }
  }

  async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
    match self.recv_raw().await? {
      Some(bytes) => self.channel.inner.payload.decode(&bytes).map(Some),
      None => Ok(None),
    }
  }

  /// Consume frames up to the terminal one.
  async fn drain(&mut self) -> Result<(), WireError> {
    while self.recv_raw().await?.is_some() {}
    Ok(())
  }
}

impl Drop for Call {
  fn drop(&mut self) {
    if !self.finished {
      let _ = self.send_frame(FrameKind::Cancel);
    }
    self.channel.inner.calls.remove(&self.id);
  }
}

/// Sending half of a client-streaming call.
pub struct ClientStreaming<Req, Resp> {
  call: Call,
  _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientStreaming<Req, Resp> {
  pub fn send(&mut self, message: &Req) -> Result<(), WireError> {
    self.call.send(message)
  }

  /// Finish sending and wait for the single response.
  pub async fn close_and_recv(mut self) -> Result<Resp, WireError> {
    self.call.send_frame(FrameKind::HalfClose)?;
    let response = self.call.recv().await?.ok_or(WireError::MissingResponse {
      method: self.call.method.name(),
    })?;
    self.call.drain().await?;
    Ok(response)
  }
}

/// Receiving half of a server-streaming call.
pub struct ServerStreaming<Resp> {
  call: Call,
  _marker: PhantomData<fn() -> Resp>,
}

impl<Resp: DeserializeOwned> ServerStreaming<Resp> {
  /// Next streamed message, `None` once the server ends the stream.
  pub async fn message(&mut self) -> Result<Option<Resp>, WireError> {
    self.call.recv().await
  }
}
