//! Runtime errors.

use std::path::PathBuf;

use volley_config::ConfigError;
use volley_flow::FlowError;
use volley_host::HostError;
use volley_master::MasterError;
use volley_matcher::{MatchError, TerminateReason};
use volley_wire::WireError;

/// Errors that can occur while running a flow.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  /// The flow tree failed validation or graph construction.
  #[error(transparent)]
  Flow(#[from] FlowError),

  /// A rendered runner document could not be decoded.
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// Rendering a runner template failed.
  #[error("failed to render '{file}': {message}")]
  Render { file: String, message: String },

  /// A collaborator (store, auth, target, output, templates, http) failed.
  #[error(transparent)]
  Host(#[from] HostError),

  /// Session setup or the worker request feed failed.
  #[error(transparent)]
  Master(#[from] MasterError),

  /// A condition or extractor in a runner document is malformed.
  #[error("invalid condition in '{file}': {source}")]
  Condition {
    file: String,
    #[source]
    source: MatchError,
  },

  /// A runner document is structurally valid but unusable.
  #[error("invalid runner '{file}': {message}")]
  InvalidRunner { file: String, message: String },

  /// A request loop stopped for a reason its `success_break` does not accept.
  #[error("request {index} terminated by {reason}")]
  Terminated {
    index: usize,
    reason: TerminateReason,
  },

  /// Worker sessions are needed but this runtime has none.
  #[error("worker sessions are not available in this process")]
  SessionsUnavailable,

  /// A remote command referenced a worker with no live session.
  #[error("worker '{worker_id}' is not connected")]
  WorkerNotConnected { worker_id: String },

  /// An RPC to a worker failed.
  #[error("{method} on worker '{worker_id}' failed")]
  Remote {
    worker_id: String,
    method: &'static str,
    #[source]
    source: WireError,
  },

  /// A worker reported an unsuccessful command.
  #[error("command {command_id} on worker '{worker_id}' failed")]
  CommandFailed {
    worker_id: String,
    command_id: String,
  },

  /// A flow node failed; carries the node id.
  #[error("flow node '{node_id}' failed")]
  Node {
    node_id: String,
    #[source]
    source: Box<RuntimeError>,
  },

  /// Creating an executor's output directory failed.
  #[error("failed to create {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// A spawned executor panicked or was aborted.
  #[error("executor task failed: {0}")]
  Join(String),
}

impl RuntimeError {
  pub(crate) fn node(node_id: &str, source: RuntimeError) -> Self {
    RuntimeError::Node {
      node_id: node_id.to_string(),
      source: Box::new(source),
    }
  }
}
