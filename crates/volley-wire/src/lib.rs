//! Volley Wire
//!
//! The master/worker protocol. One TCP (optionally TLS) connection carries
//! any number of interleaved calls; see [`frame`] for the call lifecycle.
//!
//! - [`WorkerClient`] is the dialing (master) side, [`WorkerService`] +
//!   [`serve`] the worker side.
//! - [`chunk`] splits large payloads (templates, store snapshots) into
//!   [`CHUNK_SIZE`] frames with a last-chunk flag.
//! - An optional [`Encrypter`] wraps every message body in both directions.

pub mod chunk;
mod channel;
mod client;
mod encrypt;
mod error;
pub mod frame;
pub mod message;
mod server;
mod tls;

pub use channel::{Channel, ClientStreaming, ServerStreaming};
pub use chunk::{CHUNK_SIZE, Chunk, Reassembler, chunks};
pub use client::WorkerClient;
pub use encrypt::{AeadEncrypter, Encrypter, EncrypterRegistry, Payload};
pub use error::WireError;
pub use server::{RequestStream, ResponseSink, Status, WorkerService, serve, serve_connection};
pub use tls::{ClientTls, ServerTls};
