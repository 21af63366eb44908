use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to encode message: {0}")]
  Encode(String),

  #[error("failed to decode message: {0}")]
  Decode(String),

  #[error("encryption failed: {0}")]
  Encryption(String),

  #[error("unknown encrypter: {0}")]
  UnknownEncrypter(String),

  #[error("tls setup failed: {0}")]
  Tls(String),

  #[error("connection closed")]
  ConnectionClosed,

  #[error("{method} failed on the remote side: {message}")]
  Remote { method: &'static str, message: String },

  #[error("{method} ended without a response")]
  MissingResponse { method: &'static str },

  #[error("call cancelled")]
  Cancelled,
}
