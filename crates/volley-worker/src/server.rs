use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use volley_event::NoopCaster;
use volley_host::{Collaborators, RequestSender};
use volley_runtime::{Invocation, Runtime, ValueStore};
use volley_wire::message::*;
use volley_wire::{Payload, Reassembler, RequestStream, ResponseSink, Status, WorkerService};

use crate::connection::{Connection, DefaultStores};
use crate::correlator::{Reply, RequestCorrelator};
use crate::error::WorkerError;
use crate::remote::{RemoteResources, StreamOutput};

/// The worker's command and resource server.
///
/// Every `Connect` gets an isolated [`Connection`]: its own resource cache,
/// request feed and command table. Replies to resource requests are routed
/// through one shared [`RequestCorrelator`].
pub struct WorkerServer {
  environment: String,
  sender: Arc<dyn RequestSender>,
  connections: DashMap<String, Arc<Connection>>,
  correlator: Arc<RequestCorrelator>,
  cancel: CancellationToken,
}

impl WorkerServer {
  pub fn new(environment: impl Into<String>, sender: Arc<dyn RequestSender>) -> Self {
    Self {
      environment: environment.into(),
      sender,
      connections: DashMap::new(),
      correlator: Arc::new(RequestCorrelator::new()),
      cancel: CancellationToken::new(),
    }
  }

  pub fn connection_count(&self) -> usize {
    self.connections.len()
  }

  /// Close every connection. Blocked calls on them return.
  pub fn shutdown(&self) {
    self.cancel.cancel();
    let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
    for id in ids {
      self.close(&id);
    }
  }

  fn connection(&self, connection_id: &str) -> Result<Arc<Connection>, WorkerError> {
    self
      .connections
      .get(connection_id)
      .map(|connection| connection.clone())
      .ok_or_else(|| WorkerError::UnknownConnection(connection_id.to_string()))
  }

  fn resources(&self, connection: &Arc<Connection>) -> RemoteResources {
    RemoteResources::new(connection.clone(), self.correlator.clone())
  }

  fn close(&self, connection_id: &str) -> Option<Arc<Connection>> {
    let (_, connection) = self.connections.remove(connection_id)?;
    connection.close();
    let dropped = self.correlator.drop_connection(connection_id);
    debug!(connection_id, dropped_requests = dropped, "connection_state_dropped");
    Some(connection)
  }

  /// Complete a resource request on behalf of the master.
  fn complete(&self, request_id: &str, reply: Reply) -> Result<Ack, Status> {
    let kind = reply.kind();
    self.correlator.complete(request_id, reply)?;
    debug!(request_id, kind, "worker_request_completed");
    Ok(Ack {})
  }
}

/// Reassembles the three default-store payloads of one command.
///
/// Frames of different kinds may interleave; each kind is done once its own
/// last chunk arrives.
async fn read_default_stores(
  stream: &mut RequestStream<SlaveCommandDefaultStoreRequest>,
) -> Result<Option<(String, String, DefaultStores)>, WorkerError> {
  let mut reassembler = Reassembler::new();
  let mut stores = DefaultStores::default();
  let mut done = HashSet::new();
  let mut ids: Option<(String, String)> = None;

  while let Some(frame) = stream.message().await? {
    if ids.is_none() {
      ids = Some((frame.connection_id.clone(), frame.command_id.clone()));
    }
    let Some(bytes) = reassembler.push(frame.store_kind, &frame.default_store, frame.is_last_chunk)
    else {
      continue;
    };
    let map: Map<String, Value> = if bytes.is_empty() {
      Map::new()
    } else {
      serde_json::from_slice(&bytes).map_err(|e| WorkerError::Malformed {
        kind: "default store",
        message: e.to_string(),
      })?
    };
    stores.set(frame.store_kind, map);
    done.insert(frame.store_kind);
  }

  let Some((connection_id, command_id)) = ids else {
    return Ok(None);
  };
  if done.len() < 3 {
    return Err(WorkerError::IncompleteDefaultStore {
      connection_id,
      command_id,
    });
  }
  Ok(Some((connection_id, command_id, stores)))
}

#[async_trait]
impl WorkerService for WorkerServer {
  #[instrument(name = "worker_connect", skip_all)]
  async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, Status> {
    if request.environment != self.environment {
      warn!(expected = %self.environment, actual = %request.environment, "environment_mismatch");
      return Err(
        WorkerError::EnvironmentMismatch {
          expected: self.environment.clone(),
          actual: request.environment,
        }
        .into(),
      );
    }

    let connection_id = uuid::Uuid::new_v4().to_string();
    let connection = Connection::new(connection_id.clone(), self.cancel.child_token());
    self
      .connections
      .insert(connection_id.clone(), Arc::new(connection));
    info!(connection_id = %connection_id, "master_connected");
    Ok(ConnectResponse { connection_id })
  }

  async fn disconnect(&self, request: DisconnectRequest) -> Result<Ack, Status> {
    self
      .close(&request.connection_id)
      .ok_or_else(|| WorkerError::UnknownConnection(request.connection_id.clone()))?;
    info!(connection_id = %request.connection_id, "master_disconnected");
    Ok(Ack {})
  }

  #[instrument(name = "slave_command", skip_all, fields(connection_id = %request.connection_id, loader_id = %request.loader_id))]
  async fn slave_command(
    &self,
    request: SlaveCommandRequest,
    cancel: CancellationToken,
  ) -> Result<SlaveCommandResponse, Status> {
    let connection = self.connection(&request.connection_id)?;
    let resources = self.resources(&connection);

    tokio::select! {
      _ = cancel.cancelled() => return Err(volley_wire::WireError::Cancelled.into()),
      loaded = resources.loader(&request.loader_id) => { loaded?; }
    }

    let command_id = connection.register_command(request.loader_id, request.output_root);
    debug!(command_id = %command_id, "command_registered");
    Ok(SlaveCommandResponse { command_id })
  }

  async fn slave_command_default_store(
    &self,
    mut stream: RequestStream<SlaveCommandDefaultStoreRequest>,
  ) -> Result<Ack, Status> {
    let Some((connection_id, command_id, stores)) = read_default_stores(&mut stream).await? else {
      return Err(Status::new("default store stream carried no frames"));
    };
    let command = self.connection(&connection_id)?.command(&command_id)?;
    command.set_stores(stores);
    debug!(connection_id = %connection_id, command_id = %command_id, "default_store_received");
    Ok(Ack {})
  }

  #[instrument(name = "call_exec", skip_all, fields(connection_id = %request.connection_id, command_id = %request.command_id))]
  async fn call_exec(
    &self,
    request: CallExecRequest,
    sink: ResponseSink<CallExecResponse>,
  ) -> Result<(), Status> {
    let connection = self.connection(&request.connection_id)?;
    let command = connection.command(&request.command_id)?;
    let stores = command
      .take_stores()
      .ok_or_else(|| WorkerError::MissingDefaultStore {
        connection_id: request.connection_id.clone(),
        command_id: request.command_id.clone(),
      })?;

    let caller_gone = sink.cancel_token().clone();
    let resources = Arc::new(self.resources(&connection));
    let runtime = Runtime::new(Collaborators {
      store: resources.clone(),
      auth: resources.clone(),
      output: Arc::new(StreamOutput::new(Arc::new(sink))),
      target: resources.clone(),
      templates: resources,
      sender: self.sender.clone(),
    });
    let invocation = Invocation {
      file: command.loader_id.clone(),
      values: Arc::new(ValueStore::from_map(stores.store)),
      thread_values: Arc::new(ValueStore::from_map(stores.thread_only)),
      output_root: command.output_root.clone(),
      loop_count: 0,
      call_count: 0,
      slave_values: Arc::new(stores.slave_values),
    };

    let cancel = connection.cancel_token().child_token();
    let run = runtime.execute(&invocation, &NoopCaster, &cancel);
    tokio::pin!(run);
    let result = tokio::select! {
      result = &mut run => result,
      _ = caller_gone.cancelled() => {
        cancel.cancel();
        run.await
      }
    };

    let success = result.is_ok();
    match &result {
      Ok(()) => info!("command_completed"),
      Err(e) => warn!(error = %e, "command_failed"),
    }
    if !command.post(success) {
      warn!("command_outcome_already_posted");
    }
    Ok(())
  }

  async fn receive_chanel_connect(
    &self,
    request: ReceiveChanelConnectRequest,
    sink: ResponseSink<ReceiveChanelConnectResponse>,
  ) -> Result<(), Status> {
    let connection = self.connection(&request.connection_id)?;
    let mut feed = connection.take_feed()?;
    debug!(connection_id = %request.connection_id, "request_feed_attached");

    let transport_gone = loop {
      let message = tokio::select! {
        biased;
        _ = connection.cancel_token().cancelled() => break false,
        _ = sink.cancel_token().cancelled() => break sink.connection_token().is_cancelled(),
        message = feed.recv() => message,
      };
      let Some(message) = message else { break false };
      if let Err(e) = sink.send(&message) {
        warn!(connection_id = %request.connection_id, error = %e, "request_feed_send_failed");
        break true;
      }
    };
    if transport_gone {
      // A feed attaches once, so the connection cannot be used again.
      self.close(&request.connection_id);
      info!(connection_id = %request.connection_id, "connection_lost");
    }
    debug!(connection_id = %request.connection_id, "request_feed_detached");
    Ok(())
  }

  async fn send_loader(&self, mut stream: RequestStream<SendLoaderRequest>) -> Result<Ack, Status> {
    let mut reassembler = Reassembler::new();
    while let Some(frame) = stream.message().await? {
      let Some(bytes) = reassembler.push(frame.request_id.clone(), &frame.content, frame.is_last_chunk)
      else {
        continue;
      };
      let content = String::from_utf8(bytes.to_vec()).map_err(|e| WorkerError::Malformed {
        kind: "loader",
        message: e.to_string(),
      })?;
      debug!(request_id = %frame.request_id, loader_id = %frame.loader_id, bytes = content.len(), "loader_received");
      self.complete(&frame.request_id, Reply::Loader(content))?;
    }
    Ok(Ack {})
  }

  async fn send_auth(&self, request: SendAuthRequest) -> Result<Ack, Status> {
    if request.is_default {
      let connection = self
        .correlator
        .connection_of(&request.request_id)
        .and_then(|id| self.connections.get(&id).map(|c| c.clone()));
      if let Some(connection) = connection {
        connection.cache().set_default_auth_id(&request.auth_id);
      }
    }
    self.complete(&request.request_id, Reply::Auth(request.auth))
  }

  async fn send_store_data(
    &self,
    mut stream: RequestStream<SendStoreDataRequest>,
  ) -> Result<Ack, Status> {
    let mut reassembler = Reassembler::new();
    while let Some(frame) = stream.message().await? {
      let Some(bytes) = reassembler.push(frame.request_id.clone(), &frame.data, frame.is_last_chunk)
      else {
        continue;
      };
      let malformed = |message: String| WorkerError::Malformed {
        kind: "store data",
        message,
      };
      let list: StoreExportDataList = Payload::default()
        .decode(&bytes)
        .map_err(|e| malformed(e.to_string()))?;
      let mut values = Vec::with_capacity(list.data.len());
      for data in list.data {
        let value: Value =
          serde_json::from_slice(&data.data).map_err(|e| malformed(e.to_string()))?;
        values.push(((data.bucket_id, data.store_key), value));
      }
      self.complete(&frame.request_id, Reply::StoreData(values))?;
    }
    Ok(Ack {})
  }

  async fn send_store_ok(&self, request: SendStoreOkRequest) -> Result<Ack, Status> {
    self.complete(&request.request_id, Reply::StoreOk)
  }

  async fn send_target(&self, request: SendTargetRequest) -> Result<Ack, Status> {
    self.complete(&request.request_id, Reply::Target(request.target))
  }

  async fn receive_load_term_channel(
    &self,
    request: ReceiveLoadTermChannelRequest,
    cancel: CancellationToken,
  ) -> Result<ReceiveLoadTermChannelResponse, Status> {
    let connection = self.connection(&request.connection_id)?;
    let command = connection.command(&request.command_id)?;
    let outcome = command.take_outcome().ok_or_else(|| WorkerError::TermTaken {
      connection_id: request.connection_id.clone(),
      command_id: request.command_id.clone(),
    })?;
    connection.remove_command(&request.command_id);

    let closed = || WorkerError::ConnectionClosed(request.connection_id.clone());
    let success = tokio::select! {
      _ = cancel.cancelled() => return Err(volley_wire::WireError::Cancelled.into()),
      _ = connection.cancel_token().cancelled() => return Err(closed().into()),
      outcome = outcome => outcome.map_err(|_| closed())?,
    };
    debug!(connection_id = %request.connection_id, command_id = %request.command_id, success, "command_outcome_read");
    Ok(ReceiveLoadTermChannelResponse { success })
  }
}
