//! Volley Worker
//!
//! The remote half of a distributed run. A master connects, registers
//! commands (a runner file plus its context maps) and executes them here;
//! everything a command needs beyond its context is requested back from the
//! master over the connection's request feed.
//!
//! - [`WorkerServer`] implements every worker RPC method.
//! - [`WorkerListener`] binds the socket and serves connections until
//!   cancelled.
//! - [`RemoteResources`] and [`StreamOutput`] are the collaborators commands
//!   run against.

mod connection;
mod correlator;
mod error;
mod listener;
mod remote;
mod server;

pub use connection::DefaultStores;
pub use correlator::{Reply, RequestCorrelator};
pub use error::WorkerError;
pub use listener::WorkerListener;
pub use remote::{RemoteResources, StreamOutput};
pub use server::WorkerServer;
