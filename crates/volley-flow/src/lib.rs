//! Volley Flow
//!
//! The validated form of a [`volley_config::FlowDoc`]. A [`Flow`] is an
//! immutable tree of [`FlowNode`]s, built once and shared by reference
//! (`Arc`) with every executor materialized from it.
//!
//! Key differences from the config document:
//! - Every node has an id, unique across the whole tree
//! - Node kinds are a closed enum ([`NodeKind`]) instead of a string
//! - Defaults (count, concurrency) are resolved
//! - Repetition is expanded on demand into [`Executor`] value objects

mod error;
mod executor;
mod node;

pub use error::FlowError;
pub use executor::Executor;
pub use node::{Binding, Dependency, Flow, FlowNode, NodeKind, RemoteExecutor};
