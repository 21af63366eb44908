//! Volley Config
//!
//! Serializable documents read by volley before anything runs:
//!
//! - [`FlowDoc`]: the flow tree a master executes
//! - [`RunnerDoc`] and the kind-specific runner documents a flow node's file
//!   renders to
//! - [`AppConfig`]: environment tag, template/output roots, targets, auths
//!   and worker listener settings
//!
//! Documents are YAML or JSON, picked by file extension. Field presence is
//! validated downstream (see `volley-flow`); this crate only describes shapes.

mod app;
mod duration;
mod error;
mod flow;
mod load;
mod runner;
mod value;

pub use app::{AppConfig, LoaderConfig, OutputConfig, ServerTlsDef, StoreConfig, WorkerConfig};
pub use duration::parse_duration;
pub use error::ConfigError;
pub use flow::{DependsOnDef, ExecutorDef, ExecutorOutputDef, FlowDoc, FlowStepDef, ValueDef};
pub use load::{DocumentFormat, load_document, parse_document, render_document};
pub use runner::{
  AuthRef, BreakDef, CertificateDef, ExcludeFilterDef, FlowRunnerDoc, MassExecDoc, MassRequestDef,
  MemoryValueDoc, MemoryValueEntry, OneExecDoc, OutputDef, RequestDef, RunnerDoc, RunnerKind,
  SlaveConnectDoc, SlaveDef, SleepAfter, SleepDef, SleepValueDef, StoreDataDef, StoreImportDirective,
  StoreImportDoc, StoreImportEntry, StoreValueDoc, StoreValueEntry,
};
pub use value::{AuthValue, EncryptDef, EncrypterValue, TargetValue};
