//! Volley Host
//!
//! The capabilities flow execution consumes without knowing their backing:
//!
//! - [`Store`]: bucketed key/value persistence (`store`, `store_with_extractor`, `import`)
//! - [`AuthFactor`]: credentials by id, with a process default
//! - [`OutputFactor`]: record writers for request results
//! - [`TargetFactor`]: base URLs by id
//! - [`TmplFactor`]: raw runner templates by path
//! - [`RequestSender`]: HTTP execution
//!
//! Local implementations live alongside each trait; the worker crate supplies
//! implementations that fetch from the master instead.

mod auth;
mod collaborators;
mod error;
mod http;
mod output;
mod store;
mod target;
mod template;

pub use auth::{AuthFactor, ConfigAuthFactor};
pub use collaborators::Collaborators;
pub use error::HostError;
pub use http::{HttpRequest, HttpResponse, RequestSender, ReqwestSender};
pub use output::{CsvOutputFactor, OutputFactor, RecordWriter, clear_outputs};
pub use store::{ExtractorEntry, ImportRequest, ImportedValue, MemoryStore, Store, StoreEntry};
pub use target::{ConfigTargetFactor, TargetFactor};
pub use template::{FsTemplates, TmplFactor};
