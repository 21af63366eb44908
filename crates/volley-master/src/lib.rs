//! Volley Master
//!
//! The master's view of its workers.
//!
//! - [`SessionManager`] owns one [`Session`] per worker id: dialing, the
//!   environment handshake, the inbound request feed and teardown.
//! - [`WorkerRequestHandler`] answers the resources a worker asks for
//!   (templates, credentials, targets, store values) from the master's own
//!   collaborators.

mod error;
mod handler;
mod session;

pub use error::MasterError;
pub use handler::WorkerRequestHandler;
pub use session::{ReceiveTermReason, RequestFeed, Session, SessionManager};
