use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use volley_host::{AuthFactor, ImportRequest, Store, StoreEntry, TargetFactor, TmplFactor};
use volley_wire::message::{
  ReceiveChanelConnectResponse, SendAuthRequest, SendLoaderRequest, SendStoreDataRequest,
  SendStoreOkRequest, SendTargetRequest, StoreDataList, StoreExportData, StoreExportDataList,
  StoreImportRequestList, WorkerRequest,
};
use volley_wire::{CHUNK_SIZE, Payload, Reassembler, WireError, chunks};

use crate::error::MasterError;
use crate::session::{ReceiveTermReason, Session};

/// Serves the resource requests a worker sends over its request feed.
#[derive(Clone)]
pub struct WorkerRequestHandler {
  templates: Arc<dyn TmplFactor>,
  auth: Arc<dyn AuthFactor>,
  target: Arc<dyn TargetFactor>,
  store: Arc<dyn Store>,
}

/// Partial store transfers, keyed by request id.
#[derive(Default)]
struct Pending {
  store_resources: Reassembler<String>,
  stores: Reassembler<String>,
}

impl WorkerRequestHandler {
  pub fn new(
    templates: Arc<dyn TmplFactor>,
    auth: Arc<dyn AuthFactor>,
    target: Arc<dyn TargetFactor>,
    store: Arc<dyn Store>,
  ) -> Self {
    Self {
      templates,
      auth,
      target,
      store,
    }
  }

  /// Consume the session's feed until it terminates or `cancel` fires.
  ///
  /// A receive error on the feed is an error; every other termination is a
  /// clean end. The first request that cannot be served ends the handler.
  #[instrument(name = "worker_request_handler", skip_all, fields(worker_id = %session.worker_id()))]
  pub async fn run(&self, session: Arc<Session>, cancel: CancellationToken) -> Result<(), MasterError> {
    let mut feed = session
      .take_feed()
      .ok_or_else(|| MasterError::FeedTaken(session.worker_id().to_string()))?;
    let mut pending = Pending::default();

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        request = feed.requests.recv() => match request {
          Some(request) => self.handle(&session, request, &mut pending).await?,
          None => break,
        },
      }
    }

    match feed.term.await {
      Ok(ReceiveTermReason::ResponseReceiveError(message)) => Err(MasterError::Feed {
        worker_id: session.worker_id().to_string(),
        message,
      }),
      Ok(reason) => {
        debug!(reason = ?reason, "worker_request_handler_finished");
        Ok(())
      }
      Err(_) => Ok(()),
    }
  }

  async fn handle(
    &self,
    session: &Session,
    response: ReceiveChanelConnectResponse,
    pending: &mut Pending,
  ) -> Result<(), MasterError> {
    let ReceiveChanelConnectResponse {
      request_id,
      request,
    } = response;
    let kind = request.kind();
    let resource_error = |source| MasterError::Resource {
      worker_id: session.worker_id().to_string(),
      request_id: request_id.clone(),
      source,
    };
    let call_error = |method: &'static str| {
      move |source: WireError| MasterError::Call {
        worker_id: session.worker_id().to_string(),
        method,
        source,
      }
    };
    let malformed = |message: String| MasterError::Malformed {
      worker_id: session.worker_id().to_string(),
      request_id: request_id.clone(),
      kind,
      message,
    };
    let client = session.client();

    match request {
      WorkerRequest::Loader { loader_id } => {
        let content = self
          .templates
          .factorize(&loader_id)
          .await
          .map_err(resource_error)?;
        let mut stream = client.send_loader().map_err(call_error("SendLoader"))?;
        for chunk in chunks(content.as_bytes(), CHUNK_SIZE) {
          stream
            .send(&SendLoaderRequest {
              request_id: request_id.clone(),
              loader_id: loader_id.clone(),
              content: chunk.data.to_vec(),
              is_last_chunk: chunk.is_last,
            })
            .map_err(call_error("SendLoader"))?;
        }
        stream
          .close_and_recv()
          .await
          .map_err(call_error("SendLoader"))?;
        info!(request_id = %request_id, loader_id = %loader_id, "loader_sent");
      }

      WorkerRequest::Auth {
        auth_id,
        is_default,
      } => {
        let auth = self
          .auth
          .factorize(&auth_id, is_default)
          .await
          .map_err(resource_error)?;
        client
          .send_auth(SendAuthRequest {
            request_id: request_id.clone(),
            is_default: self.auth.is_default(&auth_id),
            auth_id: auth_id.clone(),
            auth,
          })
          .await
          .map_err(call_error("SendAuth"))?;
        info!(request_id = %request_id, auth_id = %auth_id, "auth_sent");
      }

      WorkerRequest::StoreResource {
        data,
        is_last_chunk,
      } => {
        let Some(bytes) = pending
          .store_resources
          .push(request_id.clone(), &data, is_last_chunk)
        else {
          return Ok(());
        };
        let list: StoreImportRequestList = Payload::default()
          .decode(&bytes)
          .map_err(|e| malformed(e.to_string()))?;
        let requests = list
          .requests
          .into_iter()
          .map(|r| ImportRequest {
            bucket_id: r.bucket_id,
            store_key: r.store_key,
            encrypt: r.encrypt,
          })
          .collect();
        let imported = self.store.import(requests).await.map_err(resource_error)?;

        let mut export = StoreExportDataList::default();
        for value in imported {
          export.data.push(StoreExportData {
            data: serde_json::to_vec(&value.value).map_err(|e| malformed(e.to_string()))?,
            bucket_id: value.bucket_id,
            store_key: value.store_key,
          });
        }
        let payload = Payload::default()
          .encode(&export)
          .map_err(call_error("SendStoreData"))?;
        let mut stream = client
          .send_store_data()
          .map_err(call_error("SendStoreData"))?;
        for chunk in chunks(&payload, CHUNK_SIZE) {
          stream
            .send(&SendStoreDataRequest {
              request_id: request_id.clone(),
              data: chunk.data.to_vec(),
              is_last_chunk: chunk.is_last,
            })
            .map_err(call_error("SendStoreData"))?;
        }
        stream
          .close_and_recv()
          .await
          .map_err(call_error("SendStoreData"))?;
        info!(request_id = %request_id, values = export.data.len(), "store_data_sent");
      }

      WorkerRequest::Store {
        data,
        is_last_chunk,
      } => {
        let Some(bytes) = pending
          .stores
          .push(request_id.clone(), &data, is_last_chunk)
        else {
          return Ok(());
        };
        let list: StoreDataList = Payload::default()
          .decode(&bytes)
          .map_err(|e| malformed(e.to_string()))?;
        let mut entries = Vec::with_capacity(list.data.len());
        for data in list.data {
          entries.push(StoreEntry {
            value: serde_json::from_slice(&data.data).map_err(|e| malformed(e.to_string()))?,
            bucket_id: data.bucket_id,
            store_key: data.store_key,
            encrypt: data.encrypt,
          });
        }
        let count = entries.len();
        self.store.store(entries).await.map_err(resource_error)?;
        client
          .send_store_ok(SendStoreOkRequest {
            request_id: request_id.clone(),
          })
          .await
          .map_err(call_error("SendStoreOk"))?;
        info!(request_id = %request_id, values = count, "store_data_stored");
      }

      WorkerRequest::Target { target_id } => {
        let target = self
          .target
          .factorize(&target_id)
          .await
          .map_err(resource_error)?;
        client
          .send_target(SendTargetRequest {
            request_id: request_id.clone(),
            target_id: target_id.clone(),
            target,
          })
          .await
          .map_err(call_error("SendTarget"))?;
        info!(request_id = %request_id, target_id = %target_id, "target_sent");
      }
    }
    Ok(())
  }
}
