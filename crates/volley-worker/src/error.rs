use thiserror::Error;
use volley_wire::WireError;

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("environment mismatch: worker is '{expected}', master sent '{actual}'")]
  EnvironmentMismatch { expected: String, actual: String },

  #[error("unknown connection: {0}")]
  UnknownConnection(String),

  #[error("connection {connection_id}: unknown command {command_id}")]
  UnknownCommand {
    connection_id: String,
    command_id: String,
  },

  #[error("unknown request: {0}")]
  UnknownRequest(String),

  #[error("connection {0}: request feed is already attached")]
  FeedAttached(String),

  #[error("connection {0} closed")]
  ConnectionClosed(String),

  #[error("connection {connection_id}: command {command_id} has no default store")]
  MissingDefaultStore {
    connection_id: String,
    command_id: String,
  },

  #[error("connection {connection_id}: command {command_id} default store is incomplete")]
  IncompleteDefaultStore {
    connection_id: String,
    command_id: String,
  },

  #[error("connection {connection_id}: command {command_id} termination already taken")]
  TermTaken {
    connection_id: String,
    command_id: String,
  },

  #[error("request {request_id} expected a {expected} reply")]
  UnexpectedReply {
    request_id: String,
    expected: &'static str,
  },

  #[error("malformed {kind} payload: {message}")]
  Malformed { kind: &'static str, message: String },

  #[error(transparent)]
  Wire(#[from] WireError),

  #[error("failed to bind {address}: {source}")]
  Bind {
    address: String,
    #[source]
    source: std::io::Error,
  },
}
