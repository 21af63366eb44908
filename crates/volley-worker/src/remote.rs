//! Collaborators a worker runs commands with.
//!
//! Templates, credentials, targets and store values come from the master
//! through the connection's request feed and are cached per connection;
//! output records stream back on the `CallExec` call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use volley_config::{AuthValue, TargetValue};
use volley_host::{
  AuthFactor, HostError, ImportRequest, ImportedValue, OutputFactor, RecordWriter, Store,
  StoreEntry, TargetFactor, TmplFactor,
};
use volley_wire::message::{
  CallExecResponse, OutputKind, ReceiveChanelConnectResponse, StoreData, StoreDataList,
  StoreImportRequest, StoreImportRequestList, WorkerRequest,
};
use volley_wire::{CHUNK_SIZE, Payload, ResponseSink, chunks};

use crate::connection::Connection;
use crate::correlator::{Reply, RequestCorrelator};
use crate::error::WorkerError;

/// A pending request; dropping it before the reply arrives forgets the id.
struct Registration<'a> {
  correlator: &'a RequestCorrelator,
  request_id: String,
}

impl Drop for Registration<'_> {
  fn drop(&mut self) {
    self.correlator.cancel(&self.request_id);
  }
}

/// Master-backed resources of one connection.
#[derive(Clone)]
pub struct RemoteResources {
  connection: Arc<Connection>,
  correlator: Arc<RequestCorrelator>,
}

fn host_error(error: WorkerError) -> HostError {
  HostError::Remote(error.to_string())
}

fn unexpected(request_id: &str, expected: &'static str) -> WorkerError {
  WorkerError::UnexpectedReply {
    request_id: request_id.to_string(),
    expected,
  }
}

impl RemoteResources {
  pub(crate) fn new(connection: Arc<Connection>, correlator: Arc<RequestCorrelator>) -> Self {
    Self {
      connection,
      correlator,
    }
  }

  /// Send `requests` under one request id and wait for the master's reply.
  async fn request<I>(&self, requests: I) -> Result<(String, Reply), WorkerError>
  where
    I: IntoIterator<Item = WorkerRequest>,
  {
    let (request_id, reply) = self.correlator.register(self.connection.id());
    let registration = Registration {
      correlator: &self.correlator,
      request_id,
    };
    for request in requests {
      debug!(request_id = %registration.request_id, kind = request.kind(), "worker_request_sent");
      self.connection.send(ReceiveChanelConnectResponse {
        request_id: registration.request_id.clone(),
        request,
      })?;
    }

    let closed = || WorkerError::ConnectionClosed(self.connection.id().to_string());
    let reply = tokio::select! {
      _ = self.connection.cancel_token().cancelled() => return Err(closed()),
      reply = reply => reply.map_err(|_| closed())?,
    };
    Ok((registration.request_id.clone(), reply))
  }

  /// Template content for `loader_id`, fetched once per connection.
  #[instrument(name = "loader_fetch", skip(self))]
  pub async fn loader(&self, loader_id: &str) -> Result<String, WorkerError> {
    self
      .connection
      .cache()
      .loaders
      .get_or_fetch(loader_id, || async {
        let request = WorkerRequest::Loader {
          loader_id: loader_id.to_string(),
        };
        match self.request([request]).await? {
          (_, Reply::Loader(content)) => Ok(content),
          (request_id, _) => Err(unexpected(&request_id, "loader")),
        }
      })
      .await
  }

  async fn fetch_auth(&self, auth_id: &str, is_default: bool) -> Result<AuthValue, WorkerError> {
    let request = WorkerRequest::Auth {
      auth_id: auth_id.to_string(),
      is_default,
    };
    match self.request([request]).await? {
      (_, Reply::Auth(auth)) => Ok(auth),
      (request_id, _) => Err(unexpected(&request_id, "auth")),
    }
  }

  fn chunked(payload: &[u8], build: fn(Vec<u8>, bool) -> WorkerRequest) -> Vec<WorkerRequest> {
    chunks(payload, CHUNK_SIZE)
      .map(|chunk| build(chunk.data.to_vec(), chunk.is_last))
      .collect()
  }
}

#[async_trait]
impl TmplFactor for RemoteResources {
  async fn factorize(&self, path: &str) -> Result<String, HostError> {
    self.loader(path).await.map_err(host_error)
  }
}

#[async_trait]
impl AuthFactor for RemoteResources {
  async fn factorize(&self, auth_id: &str, is_default: bool) -> Result<AuthValue, HostError> {
    let cache = self.connection.cache();
    let auth = if is_default {
      cache
        .default_auth
        .get_or_try_init(|| self.fetch_auth(auth_id, true))
        .await
        .cloned()
    } else {
      cache
        .auths
        .get_or_fetch(auth_id, || self.fetch_auth(auth_id, false))
        .await
    };
    auth.map_err(host_error)
  }

  fn is_default(&self, auth_id: &str) -> bool {
    self.connection.cache().is_default_auth(auth_id)
  }
}

#[async_trait]
impl TargetFactor for RemoteResources {
  async fn factorize(&self, target_id: &str) -> Result<TargetValue, HostError> {
    self
      .connection
      .cache()
      .targets
      .get_or_fetch(target_id, || async {
        let request = WorkerRequest::Target {
          target_id: target_id.to_string(),
        };
        match self.request([request]).await? {
          (_, Reply::Target(target)) => Ok(target),
          (request_id, _) => Err(unexpected(&request_id, "target")),
        }
      })
      .await
      .map_err(host_error)
  }
}

#[async_trait]
impl Store for RemoteResources {
  async fn store(&self, entries: Vec<StoreEntry>) -> Result<(), HostError> {
    let mut list = StoreDataList::default();
    for entry in &entries {
      list.data.push(StoreData {
        bucket_id: entry.bucket_id.clone(),
        store_key: entry.store_key.clone(),
        data: serde_json::to_vec(&entry.value).map_err(|e| HostError::Encoding(e.to_string()))?,
        encrypt: entry.encrypt.clone(),
      });
    }
    let payload = Payload::default().encode(&list)?;
    let requests = Self::chunked(&payload, |data, is_last_chunk| WorkerRequest::Store {
      data,
      is_last_chunk,
    });

    match self.request(requests).await.map_err(host_error)? {
      (_, Reply::StoreOk) => {}
      (request_id, _) => return Err(host_error(unexpected(&request_id, "store ok"))),
    }

    let cache = &self.connection.cache().store;
    for entry in entries {
      cache.insert((entry.bucket_id, entry.store_key), entry.value);
    }
    Ok(())
  }

  async fn import(&self, requests: Vec<ImportRequest>) -> Result<Vec<ImportedValue>, HostError> {
    let cache = &self.connection.cache().store;
    let missing: Vec<StoreImportRequest> = requests
      .iter()
      .filter(|r| !cache.contains_key(&(r.bucket_id.clone(), r.store_key.clone())))
      .map(|r| StoreImportRequest {
        bucket_id: r.bucket_id.clone(),
        store_key: r.store_key.clone(),
        encrypt: r.encrypt.clone(),
      })
      .collect();

    if !missing.is_empty() {
      let payload = Payload::default().encode(&StoreImportRequestList { requests: missing })?;
      let chunked = Self::chunked(&payload, |data, is_last_chunk| {
        WorkerRequest::StoreResource {
          data,
          is_last_chunk,
        }
      });
      let values = match self.request(chunked).await.map_err(host_error)? {
        (_, Reply::StoreData(values)) => values,
        (request_id, _) => return Err(host_error(unexpected(&request_id, "store data"))),
      };
      for (key, value) in values {
        cache.insert(key, value);
      }
    }

    requests
      .into_iter()
      .map(|r| {
        let key = (r.bucket_id, r.store_key);
        let value = cache
          .get(&key)
          .map(|value| value.value().clone())
          .ok_or_else(|| HostError::NotFound {
            kind: "store value",
            id: format!("{}/{}", key.0, key.1),
          })?;
        Ok(ImportedValue {
          bucket_id: key.0,
          store_key: key.1,
          value,
        })
      })
      .collect()
  }
}

/// Streams every output record back to the master as it is written.
pub struct StreamOutput {
  sink: Arc<ResponseSink<CallExecResponse>>,
}

impl StreamOutput {
  pub fn new(sink: Arc<ResponseSink<CallExecResponse>>) -> Self {
    Self { sink }
  }
}

#[async_trait]
impl OutputFactor for StreamOutput {
  async fn factorize(
    &self,
    output_id: &str,
    output_root: &str,
  ) -> Result<Box<dyn RecordWriter>, HostError> {
    Ok(Box::new(StreamWriter {
      sink: self.sink.clone(),
      output_id: output_id.to_string(),
      output_root: output_root.to_string(),
    }))
  }
}

struct StreamWriter {
  sink: Arc<ResponseSink<CallExecResponse>>,
  output_id: String,
  output_root: String,
}

impl RecordWriter for StreamWriter {
  fn write(&mut self, record: &[String]) -> Result<(), HostError> {
    self.sink.send(&CallExecResponse {
      output_id: self.output_id.clone(),
      output_kind: OutputKind::Http,
      output_root: self.output_root.clone(),
      data: record.to_vec(),
    })?;
    Ok(())
  }

  fn flush(&mut self) -> Result<(), HostError> {
    Ok(())
  }
}
