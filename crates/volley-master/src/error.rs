use thiserror::Error;
use volley_host::HostError;
use volley_wire::WireError;

#[derive(Debug, Error)]
pub enum MasterError {
  #[error("worker already connected: {0}")]
  AlreadyConnected(String),

  #[error("worker not connected: {0}")]
  NotConnected(String),

  #[error("failed to connect to worker {worker_id}: {source}")]
  Connect {
    worker_id: String,
    #[source]
    source: WireError,
  },

  #[error("request feed for worker {0} is already being handled")]
  FeedTaken(String),

  #[error("worker {worker_id} call {method} failed: {source}")]
  Call {
    worker_id: String,
    method: &'static str,
    #[source]
    source: WireError,
  },

  #[error("worker {worker_id} request {request_id} failed: {source}")]
  Resource {
    worker_id: String,
    request_id: String,
    #[source]
    source: HostError,
  },

  #[error("worker {worker_id} sent a malformed {kind} request {request_id}: {message}")]
  Malformed {
    worker_id: String,
    request_id: String,
    kind: &'static str,
    message: String,
  },

  #[error("request feed of worker {worker_id} failed: {message}")]
  Feed { worker_id: String, message: String },
}
