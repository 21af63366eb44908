use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {origin}: {message}")]
  Parse { origin: String, message: String },

  #[error("failed to render document: {0}")]
  Render(String),

  #[error("unsupported document extension: {0}")]
  UnsupportedFormat(String),

  #[error("invalid duration '{0}'")]
  InvalidDuration(String),
}
