//! The worker RPC surface driven frame by frame over an in-memory stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use volley_host::{HostError, HttpRequest, HttpResponse, RequestSender};
use volley_wire::message::*;
use volley_wire::{Channel, Payload, ServerStreaming, WireError, WorkerClient, chunks, serve_connection};
use volley_worker::WorkerServer;

const RUNNER: &str = r#"
kind: StoreValue
data:
  - bucket_id: "{{ SlaveValues.SlaveID }}"
    key: "{{ ThreadValues.lane }}"
    value: "{{ Values.who }}"
"#;

struct UnusedSender;

#[async_trait]
impl RequestSender for UnusedSender {
  async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, HostError> {
    Err(HostError::InvalidRequest("no requests expected".to_string()))
  }
}

fn start() -> (WorkerClient, Arc<WorkerServer>, CancellationToken) {
  let cancel = CancellationToken::new();
  let server = Arc::new(WorkerServer::new("test", Arc::new(UnusedSender)));
  let (client_io, server_io) = tokio::io::duplex(64 * 1024);
  tokio::spawn(serve_connection(
    server_io,
    server.clone(),
    None,
    cancel.clone(),
  ));
  (
    WorkerClient::new(Channel::new(client_io, None)),
    server,
    cancel,
  )
}

async fn next_request(
  feed: &mut ServerStreaming<ReceiveChanelConnectResponse>,
) -> ReceiveChanelConnectResponse {
  tokio::time::timeout(Duration::from_secs(5), feed.message())
    .await
    .expect("worker sent no request")
    .unwrap()
    .expect("request feed ended")
}

fn map(value: Value) -> Map<String, Value> {
  match value {
    Value::Object(map) => map,
    other => panic!("not an object: {other}"),
  }
}

/// Default-store frames for `stores`, chunked small and interleaved across
/// kinds, last kind first.
fn interleaved(
  connection_id: &str,
  command_id: &str,
  stores: &[(StoreKind, Map<String, Value>)],
) -> Vec<SlaveCommandDefaultStoreRequest> {
  let payloads: Vec<(StoreKind, Vec<u8>)> = stores
    .iter()
    .rev()
    .map(|(kind, map)| (*kind, serde_json::to_vec(map).unwrap()))
    .collect();
  let mut per_kind: Vec<Vec<SlaveCommandDefaultStoreRequest>> = payloads
    .iter()
    .map(|(kind, payload)| {
      chunks(payload, 4)
        .map(|chunk| SlaveCommandDefaultStoreRequest {
          connection_id: connection_id.to_string(),
          command_id: command_id.to_string(),
          store_kind: *kind,
          default_store: chunk.data.to_vec(),
          is_last_chunk: chunk.is_last,
        })
        .collect()
    })
    .collect();

  let mut frames = Vec::new();
  let longest = per_kind.iter().map(Vec::len).max().unwrap_or(0);
  for index in 0..longest {
    for frames_of_kind in &mut per_kind {
      if index < frames_of_kind.len() {
        frames.push(frames_of_kind[index].clone());
      }
    }
  }
  frames
}

#[tokio::test]
async fn test_environment_mismatch_is_rejected() {
  let (client, server, cancel) = start();
  let err = client
    .connect(ConnectRequest {
      environment: "prod".to_string(),
    })
    .await
    .unwrap_err();
  match err {
    WireError::Remote { method, message } => {
      assert_eq!(method, "Connect");
      assert!(message.contains("environment mismatch"), "{message}");
    }
    other => panic!("unexpected error: {other:?}"),
  }
  assert_eq!(server.connection_count(), 0);
  cancel.cancel();
}

#[tokio::test]
async fn test_command_lifecycle() {
  let (client, server, cancel) = start();
  let connection_id = client
    .connect(ConnectRequest {
      environment: "test".to_string(),
    })
    .await
    .unwrap()
    .connection_id;
  let mut feed = client
    .receive_chanel_connect(ReceiveChanelConnectRequest {
      connection_id: connection_id.clone(),
    })
    .unwrap();

  // SlaveCommand blocks until the template arrives over SendLoader.
  let command = {
    let client = client.clone();
    let connection_id = connection_id.clone();
    tokio::spawn(async move {
      client
        .slave_command(SlaveCommandRequest {
          connection_id,
          loader_id: "store.yaml".to_string(),
          output_root: "out".to_string(),
        })
        .await
    })
  };
  let request = next_request(&mut feed).await;
  assert_eq!(
    request.request,
    WorkerRequest::Loader {
      loader_id: "store.yaml".to_string()
    }
  );
  let mut loader = client.send_loader().unwrap();
  for chunk in chunks(RUNNER.as_bytes(), 8) {
    loader
      .send(&SendLoaderRequest {
        request_id: request.request_id.clone(),
        loader_id: "store.yaml".to_string(),
        content: chunk.data.to_vec(),
        is_last_chunk: chunk.is_last,
      })
      .unwrap();
  }
  loader.close_and_recv().await.unwrap();
  let command_id = command.await.unwrap().unwrap().command_id;

  // Three maps, interleaved and out of order; the call only acks once all
  // three are complete.
  let mut stream = client.slave_command_default_store().unwrap();
  for frame in interleaved(
    &connection_id,
    &command_id,
    &[
      (StoreKind::Store, map(json!({"who": "ada", "padding": "x".repeat(40)}))),
      (StoreKind::ThreadOnlyStore, map(json!({"lane": "fast"}))),
      (StoreKind::SlaveValues, map(json!({"SlaveID": "w9", "Index": 0}))),
    ],
  ) {
    stream.send(&frame).unwrap();
  }
  stream.close_and_recv().await.unwrap();

  // Executing the StoreValue runner sends the entry back to the master.
  let mut exec = client
    .call_exec(CallExecRequest {
      connection_id: connection_id.clone(),
      command_id: command_id.clone(),
    })
    .unwrap();
  let request = next_request(&mut feed).await;
  let WorkerRequest::Store {
    data,
    is_last_chunk,
  } = request.request
  else {
    panic!("unexpected request {:?}", request.request);
  };
  assert!(is_last_chunk);
  let list: StoreDataList = Payload::default().decode(&data).unwrap();
  assert_eq!(list.data.len(), 1);
  assert_eq!(list.data[0].bucket_id, "w9");
  assert_eq!(list.data[0].store_key, "fast");
  assert_eq!(
    serde_json::from_slice::<Value>(&list.data[0].data).unwrap(),
    json!("ada")
  );
  client
    .send_store_ok(SendStoreOkRequest {
      request_id: request.request_id,
    })
    .await
    .unwrap();
  assert!(exec.message().await.unwrap().is_none());

  let term = ReceiveLoadTermChannelRequest {
    connection_id: connection_id.clone(),
    command_id: command_id.clone(),
  };
  assert!(
    client
      .receive_load_term_channel(term.clone())
      .await
      .unwrap()
      .success
  );
  assert!(client.receive_load_term_channel(term).await.is_err());

  // The template is cached now: no second loader request.
  let second = client
    .slave_command(SlaveCommandRequest {
      connection_id: connection_id.clone(),
      loader_id: "store.yaml".to_string(),
      output_root: "out".to_string(),
    })
    .await
    .unwrap()
    .command_id;

  let mut partial = client.slave_command_default_store().unwrap();
  for frame in interleaved(
    &connection_id,
    &second,
    &[
      (StoreKind::Store, Map::new()),
      (StoreKind::SlaveValues, Map::new()),
    ],
  ) {
    partial.send(&frame).unwrap();
  }
  match partial.close_and_recv().await.unwrap_err() {
    WireError::Remote { message, .. } => assert!(message.contains("incomplete"), "{message}"),
    other => panic!("unexpected error: {other:?}"),
  }

  let mut exec = client
    .call_exec(CallExecRequest {
      connection_id: connection_id.clone(),
      command_id: second,
    })
    .unwrap();
  assert!(matches!(
    exec.message().await,
    Err(WireError::Remote { method: "CallExec", .. })
  ));

  client
    .disconnect(DisconnectRequest {
      connection_id: connection_id.clone(),
    })
    .await
    .unwrap();
  assert_eq!(server.connection_count(), 0);
  assert!(feed.message().await.unwrap().is_none());
  assert!(
    client
      .disconnect(DisconnectRequest { connection_id })
      .await
      .is_err()
  );
  cancel.cancel();
}

#[tokio::test]
async fn test_unknown_request_reply_is_an_error() {
  let (client, _server, cancel) = start();
  let err = client
    .send_store_ok(SendStoreOkRequest {
      request_id: "never-issued".to_string(),
    })
    .await
    .unwrap_err();
  assert!(matches!(err, WireError::Remote { method: "SendStoreOk", .. }));
  cancel.cancel();
}

#[tokio::test]
async fn test_transport_drop_releases_connection() {
  let (client, server, cancel) = start();
  let connection_id = client
    .connect(ConnectRequest {
      environment: "test".to_string(),
    })
    .await
    .unwrap()
    .connection_id;
  let _feed = client
    .receive_chanel_connect(ReceiveChanelConnectRequest { connection_id })
    .unwrap();
  assert_eq!(server.connection_count(), 1);

  // No Disconnect: the transport just goes away.
  client.close();
  tokio::time::timeout(Duration::from_secs(5), async {
    while server.connection_count() > 0 {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("connection state outlived its transport");
  cancel.cancel();
}

#[tokio::test]
async fn test_abandoned_feed_keeps_connection() {
  let (client, server, cancel) = start();
  let connection_id = client
    .connect(ConnectRequest {
      environment: "test".to_string(),
    })
    .await
    .unwrap()
    .connection_id;
  let feed = client
    .receive_chanel_connect(ReceiveChanelConnectRequest {
      connection_id: connection_id.clone(),
    })
    .unwrap();
  drop(feed);
  tokio::time::sleep(Duration::from_millis(100)).await;

  // Cancelling only the feed call leaves the connection for Disconnect.
  assert_eq!(server.connection_count(), 1);
  client
    .disconnect(DisconnectRequest { connection_id })
    .await
    .unwrap();
  assert_eq!(server.connection_count(), 0);
  cancel.cancel();
}
