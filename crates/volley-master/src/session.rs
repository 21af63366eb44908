use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use volley_config::SlaveDef;
use volley_event::{Event, EventCaster};
use volley_wire::message::{
  ConnectRequest, DisconnectRequest, ReceiveChanelConnectRequest, ReceiveChanelConnectResponse,
};
use volley_wire::{ClientTls, EncrypterRegistry, ServerStreaming, WorkerClient};

use crate::error::MasterError;

/// Why a session's request feed stopped. Reported exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveTermReason {
  /// The worker ended the stream.
  Eof,
  /// Receiving failed; the message describes the transport error.
  ResponseReceiveError(String),
  /// The run the session belongs to was cancelled.
  StreamContextDone,
  /// The session was disconnected locally.
  Disconnected,
}

/// Inbound worker requests plus the single termination report that follows
/// them. `requests` closes after `term` has been sent.
pub struct RequestFeed {
  pub requests: mpsc::UnboundedReceiver<ReceiveChanelConnectResponse>,
  pub term: oneshot::Receiver<ReceiveTermReason>,
}

/// A live connection to one worker.
pub struct Session {
  worker_id: String,
  connection_id: String,
  client: WorkerClient,
  disconnect: CancellationToken,
  feed: Mutex<Option<RequestFeed>>,
}

impl Session {
  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  pub fn connection_id(&self) -> &str {
    &self.connection_id
  }

  pub fn client(&self) -> &WorkerClient {
    &self.client
  }

  /// Hand the request feed to its consumer. Only the first call gets it.
  pub fn take_feed(&self) -> Option<RequestFeed> {
    self.feed.lock().ok().and_then(|mut feed| feed.take())
  }
}

type SessionTable = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// Session table for one master process.
///
/// The table lock is never held across I/O; the receive loops run on their
/// own tasks. A session whose feed ends on the worker side (`Eof` or a
/// receive error) is removed by its receive loop.
pub struct SessionManager {
  environment: String,
  encrypters: EncrypterRegistry,
  cancel: CancellationToken,
  sessions: SessionTable,
}

impl SessionManager {
  pub fn new(
    environment: impl Into<String>,
    encrypters: EncrypterRegistry,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      environment: environment.into(),
      encrypters,
      cancel,
      sessions: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  pub fn find(&self, worker_id: &str) -> Option<Arc<Session>> {
    self
      .sessions
      .read()
      .ok()
      .and_then(|sessions| sessions.get(worker_id).cloned())
  }

  pub fn len(&self) -> usize {
    self.sessions.read().map(|s| s.len()).unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Connect every slave, bracketed by the connecting/connected events.
  ///
  /// `connected` is cast even when a connection fails. Casts do not wait for
  /// delivery.
  pub async fn connect_all(
    &self,
    slaves: &[SlaveDef],
    caster: &dyn EventCaster,
  ) -> Result<Vec<Arc<Session>>, MasterError> {
    let _ = caster.cast(Event::SlaveConnecting);

    let mut sessions = Vec::with_capacity(slaves.len());
    let mut result = Ok(());
    for slave in slaves {
      match self.connect(slave).await {
        Ok(session) => sessions.push(session),
        Err(e) => {
          result = Err(e);
          break;
        }
      }
    }

    let _ = caster.cast(Event::SlaveConnected);
    result.map(|_| sessions)
  }

  /// Dial a worker, run the environment handshake and start its request
  /// feed. Fails if a session for `slave.id` already exists.
  #[instrument(name = "worker_connect", skip_all, fields(worker_id = %slave.id, uri = %slave.uri))]
  pub async fn connect(&self, slave: &SlaveDef) -> Result<Arc<Session>, MasterError> {
    if self.find(&slave.id).is_some() {
      return Err(MasterError::AlreadyConnected(slave.id.clone()));
    }

    let connect_error = |source| MasterError::Connect {
      worker_id: slave.id.clone(),
      source,
    };

    let tls = slave.certificate.enabled.then(|| ClientTls {
      ca_cert: slave.certificate.ca_cert.clone(),
      server_name_override: slave.certificate.server_name_override.clone(),
      insecure_skip_verify: slave.certificate.insecure_skip_verify,
    });
    let encrypter = self
      .encrypters
      .resolve(&slave.encrypt)
      .map_err(connect_error)?;

    let client = WorkerClient::dial(&slave.uri, tls.as_ref(), encrypter)
      .await
      .map_err(connect_error)?;
    let response = client
      .connect(ConnectRequest {
        environment: self.environment.clone(),
      })
      .await
      .map_err(connect_error)?;
    let stream = client
      .receive_chanel_connect(ReceiveChanelConnectRequest {
        connection_id: response.connection_id.clone(),
      })
      .map_err(connect_error)?;

    let (request_tx, requests) = mpsc::unbounded_channel();
    let (term_tx, term) = oneshot::channel();
    let session = Arc::new(Session {
      worker_id: slave.id.clone(),
      connection_id: response.connection_id,
      client,
      disconnect: CancellationToken::new(),
      feed: Mutex::new(Some(RequestFeed { requests, term })),
    });

    let inserted = match self.sessions.write() {
      Ok(mut sessions) if !sessions.contains_key(&slave.id) => {
        sessions.insert(slave.id.clone(), session.clone());
        true
      }
      _ => false,
    };
    if !inserted {
      // Lost a race with a concurrent connect for the same id.
      session.client.close();
      return Err(MasterError::AlreadyConnected(slave.id.clone()));
    }

    tokio::spawn(receive_loop(
      session.clone(),
      self.sessions.clone(),
      stream,
      request_tx,
      term_tx,
      self.cancel.clone(),
    ));

    info!(connection_id = %session.connection_id, "worker_connected");
    Ok(session)
  }

  /// Stop the request feed, tell the worker, close the transport and forget
  /// the session.
  #[instrument(name = "worker_disconnect", skip(self))]
  pub async fn disconnect(&self, worker_id: &str) -> Result<(), MasterError> {
    let session = self
      .find(worker_id)
      .ok_or_else(|| MasterError::NotConnected(worker_id.to_string()))?;

    session.disconnect.cancel();
    let result = session
      .client
      .disconnect(DisconnectRequest {
        connection_id: session.connection_id.clone(),
      })
      .await;
    session.client.close();
    if let Ok(mut sessions) = self.sessions.write() {
      sessions.remove(worker_id);
    }

    result.map(|_| ()).map_err(|source| MasterError::Call {
      worker_id: worker_id.to_string(),
      method: "Disconnect",
      source,
    })?;
    info!("worker_disconnected");
    Ok(())
  }

  /// Disconnect every session. All sessions are torn down; the first error
  /// is returned.
  pub async fn disconnect_all(&self) -> Result<(), MasterError> {
    let ids: Vec<String> = self
      .sessions
      .read()
      .map(|sessions| sessions.keys().cloned().collect())
      .unwrap_or_default();

    let mut first_error = None;
    for id in ids {
      if let Err(e) = self.disconnect(&id).await {
        warn!(worker_id = %id, error = %e, "worker_disconnect_failed");
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }
}

async fn receive_loop(
  session: Arc<Session>,
  sessions: SessionTable,
  mut stream: ServerStreaming<ReceiveChanelConnectResponse>,
  requests: mpsc::UnboundedSender<ReceiveChanelConnectResponse>,
  term: oneshot::Sender<ReceiveTermReason>,
  cancel: CancellationToken,
) {
  let worker_id = session.worker_id.clone();
  let reason = loop {
    tokio::select! {
      biased;
      _ = session.disconnect.cancelled() => break ReceiveTermReason::Disconnected,
      _ = cancel.cancelled() => break ReceiveTermReason::StreamContextDone,
      message = stream.message() => match message {
        Ok(Some(request)) => {
          debug!(worker_id = %worker_id, request_id = %request.request_id, kind = request.request.kind(), "worker_request_received");
          if requests.send(request).is_err() {
            debug!(worker_id = %worker_id, "worker_request_dropped");
          }
        }
        Ok(None) => break ReceiveTermReason::Eof,
        Err(e) => break ReceiveTermReason::ResponseReceiveError(e.to_string()),
      },
    }
  };

  info!(worker_id = %worker_id, reason = ?reason, "request_feed_terminated");
  match &reason {
    ReceiveTermReason::Eof => forget(&sessions, &session),
    ReceiveTermReason::ResponseReceiveError(_) => {
      forget(&sessions, &session);
      session.client.close();
    }
    ReceiveTermReason::StreamContextDone | ReceiveTermReason::Disconnected => {}
  }
  let _ = term.send(reason);
  drop(requests);
}

/// Remove `session` from the table unless a newer session took its id.
fn forget(sessions: &SessionTable, session: &Arc<Session>) {
  if let Ok(mut sessions) = sessions.write()
    && sessions
      .get(&session.worker_id)
      .is_some_and(|current| Arc::ptr_eq(current, session))
  {
    sessions.remove(&session.worker_id);
    debug!(worker_id = %session.worker_id, "worker_session_forgotten");
  }
}
