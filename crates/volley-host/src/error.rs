use std::path::PathBuf;

use thiserror::Error;
use volley_matcher::MatchError;
use volley_wire::WireError;

#[derive(Debug, Error)]
pub enum HostError {
  #[error("{kind} not found: {id}")]
  NotFound { kind: &'static str, id: String },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("failed to encode value: {0}")]
  Encoding(String),

  #[error("output error: {0}")]
  Output(String),

  #[error(transparent)]
  Wire(#[from] WireError),

  #[error("failed to extract value for {store_key}: {source}")]
  Extract {
    store_key: String,
    #[source]
    source: MatchError,
  },

  #[error("remote resource failed: {0}")]
  Remote(String),
}
