//! Request and response types for every worker RPC method.

use serde::{Deserialize, Serialize};
use volley_config::{AuthValue, EncryptDef, TargetValue};

/// The RPC methods a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
  Connect,
  Disconnect,
  SlaveCommand,
  SlaveCommandDefaultStore,
  CallExec,
  ReceiveChanelConnect,
  SendLoader,
  SendAuth,
  SendStoreData,
  SendStoreOk,
  SendTarget,
  ReceiveLoadTermChannel,
}

impl Method {
  pub fn name(self) -> &'static str {
    match self {
      Method::Connect => "Connect",
      Method::Disconnect => "Disconnect",
      Method::SlaveCommand => "SlaveCommand",
      Method::SlaveCommandDefaultStore => "SlaveCommandDefaultStore",
      Method::CallExec => "CallExec",
      Method::ReceiveChanelConnect => "ReceiveChanelConnect",
      Method::SendLoader => "SendLoader",
      Method::SendAuth => "SendAuth",
      Method::SendStoreData => "SendStoreData",
      Method::SendStoreOk => "SendStoreOk",
      Method::SendTarget => "SendTarget",
      Method::ReceiveLoadTermChannel => "ReceiveLoadTermChannel",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
  pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
  pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
  pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveCommandRequest {
  pub connection_id: String,
  pub loader_id: String,
  pub output_root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveCommandResponse {
  pub command_id: String,
}

/// Which of the three context maps a default-store frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
  Store,
  ThreadOnlyStore,
  SlaveValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveCommandDefaultStoreRequest {
  pub connection_id: String,
  pub command_id: String,
  pub store_kind: StoreKind,
  /// JSON object bytes for this chunk.
  pub default_store: Vec<u8>,
  pub is_last_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallExecRequest {
  pub connection_id: String,
  pub command_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
  Http,
}

/// One output record produced while a command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallExecResponse {
  pub output_id: String,
  pub output_kind: OutputKind,
  pub output_root: String,
  pub data: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveChanelConnectRequest {
  pub connection_id: String,
}

/// A resource the worker asks the master for over its request feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
  Loader { loader_id: String },
  Auth { auth_id: String, is_default: bool },
  /// Chunk of a bincode [`StoreImportRequestList`].
  StoreResource { data: Vec<u8>, is_last_chunk: bool },
  /// Chunk of a bincode [`StoreDataList`].
  Store { data: Vec<u8>, is_last_chunk: bool },
  Target { target_id: String },
}

impl WorkerRequest {
  pub fn kind(&self) -> &'static str {
    match self {
      WorkerRequest::Loader { .. } => "loader",
      WorkerRequest::Auth { .. } => "auth",
      WorkerRequest::StoreResource { .. } => "store_resource",
      WorkerRequest::Store { .. } => "store",
      WorkerRequest::Target { .. } => "target",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveChanelConnectResponse {
  pub request_id: String,
  pub request: WorkerRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLoaderRequest {
  pub request_id: String,
  pub loader_id: String,
  pub content: Vec<u8>,
  pub is_last_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAuthRequest {
  pub request_id: String,
  pub auth_id: String,
  pub auth: AuthValue,
  pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStoreDataRequest {
  pub request_id: String,
  /// Chunk of a bincode [`StoreExportDataList`].
  pub data: Vec<u8>,
  pub is_last_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStoreOkRequest {
  pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTargetRequest {
  pub request_id: String,
  pub target_id: String,
  pub target: TargetValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveLoadTermChannelRequest {
  pub connection_id: String,
  pub command_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveLoadTermChannelResponse {
  pub success: bool,
}

/// Acknowledgement for methods with no response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreImportRequest {
  pub bucket_id: String,
  pub store_key: String,
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreImportRequestList {
  pub requests: Vec<StoreImportRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreExportData {
  pub bucket_id: String,
  pub store_key: String,
  /// JSON bytes of the stored value.
  pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreExportDataList {
  pub data: Vec<StoreExportData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
  pub bucket_id: String,
  pub store_key: String,
  /// JSON bytes of the value to store.
  pub data: Vec<u8>,
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDataList {
  pub data: Vec<StoreData>,
}
