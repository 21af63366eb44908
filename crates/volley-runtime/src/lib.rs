//! Volley Runtime
//!
//! Executes flows. A [`Runtime`] holds the collaborators a run consumes and,
//! on a master, the worker session table.
//!
//! - [`Runtime::run_flow`] drives a flow tree: dependency latches over
//!   per-node event broadcasters, sequential or bounded-concurrent cohorts,
//!   nested flows and remote commands.
//! - [`Runtime::execute`] runs a single runner file through the local
//!   pipeline (render, optional store import, sleep, dispatch on kind). Workers
//!   use it directly for the commands they receive.
//! - [`ValueStore`] is the concurrent key/value map runner templates read
//!   from; [`RenderContext`] is what they are rendered against.

mod error;
mod orchestrator;
mod remote;
mod render;
mod runner;
mod runtime;
mod values;

pub use error::RuntimeError;
pub use orchestrator::EventRegistry;
pub use render::{Dynamic, RenderContext, render};
pub use runner::Invocation;
pub use runtime::Runtime;
pub use values::ValueStore;
