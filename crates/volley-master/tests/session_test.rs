use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use volley_config::{AuthValue, EncryptDef, SlaveDef, TargetValue};
use volley_event::{Broadcaster, BroadcastCaster, Event};
use volley_host::{
  ConfigAuthFactor, ConfigTargetFactor, FsTemplates, ImportRequest, MemoryStore, Store, StoreEntry,
};
use volley_master::{MasterError, ReceiveTermReason, SessionManager, WorkerRequestHandler};
use volley_wire::message::*;
use volley_wire::{
  EncrypterRegistry, Payload, Reassembler, RequestStream, ResponseSink, Status, WorkerService,
  chunks, serve,
};

/// Worker double: replays a scripted request feed and records every reply.
#[derive(Default)]
struct ScriptedWorker {
  script: Vec<ReceiveChanelConnectResponse>,
  hold_feed: bool,
  loaders: Mutex<Vec<(String, String)>>,
  auths: Mutex<Vec<SendAuthRequest>>,
  targets: Mutex<Vec<SendTargetRequest>>,
  store_data: Mutex<Vec<StoreExportDataList>>,
  store_oks: Mutex<Vec<String>>,
  disconnects: Mutex<Vec<String>>,
}

#[async_trait]
impl WorkerService for ScriptedWorker {
  async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, Status> {
    if request.environment != "test" {
      return Err(Status::new(format!(
        "environment mismatch: {}",
        request.environment
      )));
    }
    Ok(ConnectResponse {
      connection_id: "conn-1".to_string(),
    })
  }

  async fn disconnect(&self, request: DisconnectRequest) -> Result<Ack, Status> {
    self.disconnects.lock().unwrap().push(request.connection_id);
    Ok(Ack {})
  }

  async fn slave_command(
    &self,
    _request: SlaveCommandRequest,
    _cancel: CancellationToken,
  ) -> Result<SlaveCommandResponse, Status> {
    Err(Status::new("unused"))
  }

  async fn slave_command_default_store(
    &self,
    _stream: RequestStream<SlaveCommandDefaultStoreRequest>,
  ) -> Result<Ack, Status> {
    Err(Status::new("unused"))
  }

  async fn call_exec(
    &self,
    _request: CallExecRequest,
    _sink: ResponseSink<CallExecResponse>,
  ) -> Result<(), Status> {
    Err(Status::new("unused"))
  }

  async fn receive_chanel_connect(
    &self,
    _request: ReceiveChanelConnectRequest,
    sink: ResponseSink<ReceiveChanelConnectResponse>,
  ) -> Result<(), Status> {
    for request in &self.script {
      sink.send(request)?;
    }
    if self.hold_feed {
      sink.cancel_token().cancelled().await;
    }
    Ok(())
  }

  async fn send_loader(&self, mut stream: RequestStream<SendLoaderRequest>) -> Result<Ack, Status> {
    let mut content = Vec::new();
    let mut loader_id = String::new();
    while let Some(chunk) = stream.message().await? {
      loader_id = chunk.loader_id;
      content.extend_from_slice(&chunk.content);
    }
    self
      .loaders
      .lock()
      .unwrap()
      .push((loader_id, String::from_utf8_lossy(&content).into_owned()));
    Ok(Ack {})
  }

  async fn send_auth(&self, request: SendAuthRequest) -> Result<Ack, Status> {
    self.auths.lock().unwrap().push(request);
    Ok(Ack {})
  }

  async fn send_store_data(
    &self,
    mut stream: RequestStream<SendStoreDataRequest>,
  ) -> Result<Ack, Status> {
    let mut reassembler = Reassembler::new();
    while let Some(chunk) = stream.message().await? {
      if let Some(bytes) = reassembler.push(chunk.request_id, &chunk.data, chunk.is_last_chunk) {
        let list: StoreExportDataList = Payload::default().decode(&bytes)?;
        self.store_data.lock().unwrap().push(list);
      }
    }
    Ok(Ack {})
  }

  async fn send_store_ok(&self, request: SendStoreOkRequest) -> Result<Ack, Status> {
    self.store_oks.lock().unwrap().push(request.request_id);
    Ok(Ack {})
  }

  async fn send_target(&self, request: SendTargetRequest) -> Result<Ack, Status> {
    self.targets.lock().unwrap().push(request);
    Ok(Ack {})
  }

  async fn receive_load_term_channel(
    &self,
    _request: ReceiveLoadTermChannelRequest,
    _cancel: CancellationToken,
  ) -> Result<ReceiveLoadTermChannelResponse, Status> {
    Err(Status::new("unused"))
  }
}

async fn start(worker: Arc<ScriptedWorker>, cancel: CancellationToken) -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = listener.local_addr().unwrap().to_string();
  tokio::spawn(serve(listener, None, worker, None, cancel));
  address
}

fn slave(id: &str, uri: &str) -> SlaveDef {
  SlaveDef {
    id: id.to_string(),
    uri: uri.to_string(),
    certificate: Default::default(),
    encrypt: EncryptDef::default(),
  }
}

fn feed_request(request_id: &str, request: WorkerRequest) -> ReceiveChanelConnectResponse {
  ReceiveChanelConnectResponse {
    request_id: request_id.to_string(),
    request,
  }
}

/// Split a bincode payload into feed requests built by `make`.
fn chunked(
  request_id: &str,
  payload: &[u8],
  make: impl Fn(Vec<u8>, bool) -> WorkerRequest,
) -> Vec<ReceiveChanelConnectResponse> {
  chunks(payload, 16)
    .map(|chunk| feed_request(request_id, make(chunk.data.to_vec(), chunk.is_last)))
    .collect()
}

#[tokio::test]
async fn test_connect_twice_fails() {
  let cancel = CancellationToken::new();
  let worker = Arc::new(ScriptedWorker {
    hold_feed: true,
    ..Default::default()
  });
  let address = start(worker.clone(), cancel.clone()).await;

  let manager = SessionManager::new("test", EncrypterRegistry::new(), cancel.clone());
  let session = manager.connect(&slave("w1", &address)).await.unwrap();
  assert_eq!(session.connection_id(), "conn-1");

  let second = manager.connect(&slave("w1", &address)).await;
  assert!(matches!(second, Err(MasterError::AlreadyConnected(id)) if id == "w1"));

  manager.disconnect("w1").await.unwrap();
  assert!(manager.find("w1").is_none());
  assert_eq!(*worker.disconnects.lock().unwrap(), vec!["conn-1".to_string()]);

  // A fresh connect after disconnecting is allowed.
  manager.connect(&slave("w1", &address)).await.unwrap();
  manager.disconnect_all().await.unwrap();
  assert!(manager.is_empty());
  cancel.cancel();
}

#[tokio::test]
async fn test_environment_mismatch_rejected() {
  let cancel = CancellationToken::new();
  let address = start(Arc::new(ScriptedWorker::default()), cancel.clone()).await;

  let manager = SessionManager::new("prod", EncrypterRegistry::new(), cancel.clone());
  let result = manager.connect(&slave("w1", &address)).await;
  assert!(matches!(result, Err(MasterError::Connect { .. })));
  assert!(manager.find("w1").is_none());
  cancel.cancel();
}

#[tokio::test]
async fn test_disconnect_unknown_worker() {
  let manager = SessionManager::new("test", EncrypterRegistry::new(), CancellationToken::new());
  assert!(matches!(
    manager.disconnect("ghost").await,
    Err(MasterError::NotConnected(_))
  ));
}

#[tokio::test]
async fn test_connect_all_casts_events() {
  let cancel = CancellationToken::new();
  let address = start(
    Arc::new(ScriptedWorker {
      hold_feed: true,
      ..Default::default()
    }),
    cancel.clone(),
  )
  .await;

  let broadcaster = Arc::new(Broadcaster::new());
  let mut subscription = broadcaster.subscribe();
  let caster = BroadcastCaster::new("connect", broadcaster.clone());
  let manager = Arc::new(SessionManager::new(
    "test",
    EncrypterRegistry::new(),
    cancel.clone(),
  ));

  let slaves = vec![slave("w1", &address), slave("w2", &address)];
  let connect = {
    let manager = manager.clone();
    tokio::spawn(async move { manager.connect_all(&slaves, &caster).await.map(|s| s.len()) })
  };

  assert_eq!(subscription.recv().await, Some(Event::SlaveConnecting));
  assert_eq!(subscription.recv().await, Some(Event::SlaveConnected));
  assert_eq!(connect.await.unwrap().unwrap(), 2);

  manager.disconnect_all().await.unwrap();
  cancel.cancel();
}

#[tokio::test]
async fn test_handler_serves_every_resource_kind() {
  let dir = tempfile::tempdir().unwrap();
  std::fs::write(dir.path().join("runner.yaml"), "x".repeat(3000)).unwrap();

  let store = Arc::new(MemoryStore::new(EncrypterRegistry::new()));
  store
    .store(vec![StoreEntry {
      bucket_id: "b".to_string(),
      store_key: "k".to_string(),
      value: json!({"v": 1}),
      encrypt: EncryptDef::default(),
    }])
    .await
    .unwrap();

  let import = Payload::default()
    .encode(&StoreImportRequestList {
      requests: vec![StoreImportRequest {
        bucket_id: "b".to_string(),
        store_key: "k".to_string(),
        encrypt: EncryptDef::default(),
      }],
    })
    .unwrap();
  let stored = Payload::default()
    .encode(&StoreDataList {
      data: vec![StoreData {
        bucket_id: "b".to_string(),
        store_key: "new".to_string(),
        data: serde_json::to_vec(&json!("hello")).unwrap(),
        encrypt: EncryptDef::default(),
      }],
    })
    .unwrap();

  let mut script = vec![
    feed_request(
      "r1",
      WorkerRequest::Loader {
        loader_id: "runner.yaml".to_string(),
      },
    ),
    feed_request(
      "r2",
      WorkerRequest::Auth {
        auth_id: "main".to_string(),
        is_default: false,
      },
    ),
    feed_request(
      "r3",
      WorkerRequest::Target {
        target_id: "api".to_string(),
      },
    ),
  ];
  script.extend(chunked("r4", &import, |data, is_last_chunk| {
    WorkerRequest::StoreResource {
      data,
      is_last_chunk,
    }
  }));
  script.extend(chunked("r5", &stored, |data, is_last_chunk| {
    WorkerRequest::Store {
      data,
      is_last_chunk,
    }
  }));

  let cancel = CancellationToken::new();
  let worker = Arc::new(ScriptedWorker {
    script,
    ..Default::default()
  });
  let address = start(worker.clone(), cancel.clone()).await;

  let mut auths = HashMap::new();
  auths.insert(
    "main".to_string(),
    AuthValue::Bearer {
      token: "secret".to_string(),
    },
  );
  let mut targets = HashMap::new();
  targets.insert(
    "api".to_string(),
    TargetValue {
      url: "http://localhost:8080".to_string(),
    },
  );
  let handler = WorkerRequestHandler::new(
    Arc::new(FsTemplates::new(dir.path())),
    Arc::new(ConfigAuthFactor::new(auths, Some("main".to_string()))),
    Arc::new(ConfigTargetFactor::new(targets)),
    store.clone(),
  );

  let manager = SessionManager::new("test", EncrypterRegistry::new(), cancel.clone());
  let session = manager.connect(&slave("w1", &address)).await.unwrap();
  tokio::time::timeout(Duration::from_secs(5), handler.run(session, cancel.clone()))
    .await
    .unwrap()
    .unwrap();

  let loaders = worker.loaders.lock().unwrap().clone();
  assert_eq!(loaders, vec![("runner.yaml".to_string(), "x".repeat(3000))]);

  let auths = worker.auths.lock().unwrap().clone();
  assert_eq!(auths.len(), 1);
  assert!(auths[0].is_default);
  assert_eq!(
    auths[0].auth,
    AuthValue::Bearer {
      token: "secret".to_string()
    }
  );

  let targets = worker.targets.lock().unwrap().clone();
  assert_eq!(targets[0].target.url, "http://localhost:8080");

  let exported = worker.store_data.lock().unwrap().clone();
  assert_eq!(exported.len(), 1);
  assert_eq!(
    serde_json::from_slice::<serde_json::Value>(&exported[0].data[0].data).unwrap(),
    json!({"v": 1})
  );

  assert_eq!(*worker.store_oks.lock().unwrap(), vec!["r5".to_string()]);
  let values = store
    .import(vec![ImportRequest {
      bucket_id: "b".to_string(),
      store_key: "new".to_string(),
      encrypt: EncryptDef::default(),
    }])
    .await
    .unwrap();
  assert_eq!(values[0].value, json!("hello"));

  cancel.cancel();
}

#[tokio::test]
async fn test_handler_ends_cleanly_on_disconnect() {
  let cancel = CancellationToken::new();
  let address = start(
    Arc::new(ScriptedWorker {
      hold_feed: true,
      ..Default::default()
    }),
    cancel.clone(),
  )
  .await;

  let dir = tempfile::tempdir().unwrap();
  let handler = WorkerRequestHandler::new(
    Arc::new(FsTemplates::new(dir.path())),
    Arc::new(ConfigAuthFactor::new(HashMap::new(), None)),
    Arc::new(ConfigTargetFactor::new(HashMap::new())),
    Arc::new(MemoryStore::new(EncrypterRegistry::new())),
  );

  let manager = SessionManager::new("test", EncrypterRegistry::new(), cancel.clone());
  let session = manager.connect(&slave("w1", &address)).await.unwrap();
  let run = tokio::spawn({
    let handler = handler.clone();
    let session = session.clone();
    let cancel = cancel.clone();
    async move { handler.run(session, cancel).await }
  });

  manager.disconnect("w1").await.unwrap();
  tokio::time::timeout(Duration::from_secs(5), run)
    .await
    .unwrap()
    .unwrap()
    .unwrap();

  // The feed can only be consumed once.
  assert!(matches!(
    handler.run(session, cancel.clone()).await,
    Err(MasterError::FeedTaken(_))
  ));
  cancel.cancel();
}

#[tokio::test]
async fn test_handler_fails_on_unknown_resource() {
  let cancel = CancellationToken::new();
  let address = start(
    Arc::new(ScriptedWorker {
      script: vec![feed_request(
        "r1",
        WorkerRequest::Target {
          target_id: "missing".to_string(),
        },
      )],
      hold_feed: true,
      ..Default::default()
    }),
    cancel.clone(),
  )
  .await;

  let dir = tempfile::tempdir().unwrap();
  let handler = WorkerRequestHandler::new(
    Arc::new(FsTemplates::new(dir.path())),
    Arc::new(ConfigAuthFactor::new(HashMap::new(), None)),
    Arc::new(ConfigTargetFactor::new(HashMap::new())),
    Arc::new(MemoryStore::new(EncrypterRegistry::new())),
  );
  let manager = SessionManager::new("test", EncrypterRegistry::new(), cancel.clone());
  let session = manager.connect(&slave("w1", &address)).await.unwrap();

  let result = handler.run(session, cancel.clone()).await;
  assert!(matches!(
    result,
    Err(MasterError::Resource { request_id, .. }) if request_id == "r1"
  ));
  manager.disconnect_all().await.unwrap();
  cancel.cancel();
}

#[tokio::test]
async fn test_session_forgotten_after_stream_error() {
  let cancel = CancellationToken::new();
  let worker_cancel = CancellationToken::new();
  let worker = Arc::new(ScriptedWorker {
    hold_feed: true,
    ..Default::default()
  });
  let address = start(worker.clone(), worker_cancel.clone()).await;

  let manager = SessionManager::new("test", EncrypterRegistry::new(), cancel.clone());
  let session = manager.connect(&slave("w1", &address)).await.unwrap();
  let feed = session.take_feed().unwrap();

  // The worker goes away without a Disconnect.
  worker_cancel.cancel();
  let reason = tokio::time::timeout(Duration::from_secs(5), feed.term)
    .await
    .unwrap()
    .unwrap();
  assert!(matches!(reason, ReceiveTermReason::ResponseReceiveError(_)), "{reason:?}");
  assert!(manager.find("w1").is_none());
  assert!(session.client().channel().is_closed());

  // The id is free again for a worker that came back.
  let address = start(worker, cancel.clone()).await;
  manager.connect(&slave("w1", &address)).await.unwrap();
  manager.disconnect_all().await.unwrap();
  cancel.cancel();
}

#[tokio::test]
async fn test_session_forgotten_after_feed_ends() {
  let cancel = CancellationToken::new();
  let address = start(Arc::new(ScriptedWorker::default()), cancel.clone()).await;

  let manager = SessionManager::new("test", EncrypterRegistry::new(), cancel.clone());
  let session = manager.connect(&slave("w1", &address)).await.unwrap();
  let feed = session.take_feed().unwrap();

  let reason = tokio::time::timeout(Duration::from_secs(5), feed.term)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reason, ReceiveTermReason::Eof);
  assert!(manager.is_empty());
  cancel.cancel();
}
