//! Runner documents: what a flow node's file renders to.
//!
//! A rendered file is first read as a [`RunnerDoc`] (kind, sleeps, store
//! imports) and then again as the kind-specific document.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use volley_matcher::{BodyConditionDef, ExtractorDef, IntConditionDef};

use crate::flow::FlowDoc;
use crate::value::EncryptDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerKind {
  StoreValue,
  MemoryValue,
  StoreImport,
  OneExecute,
  MassExecute,
  SlaveConnect,
  Flow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerDoc {
  pub kind: RunnerKind,
  #[serde(default)]
  pub sleep: SleepDef,
  #[serde(default)]
  pub store_import: StoreImportDirective,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepDef {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub values: Vec<SleepValueDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepValueDef {
  pub duration: String,
  pub after: SleepAfter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SleepAfter {
  Init,
  Exec,
  FailedExec,
}

/// Store values pulled in before the runner body is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImportDirective {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub data: Vec<StoreImportEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreImportEntry {
  pub bucket_id: String,
  /// Name the value is bound to in the value store.
  pub key: String,
  pub store_key: String,
  #[serde(default)]
  pub thread_only: bool,
  #[serde(default)]
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreValueDoc {
  #[serde(default)]
  pub data: Vec<StoreValueEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreValueEntry {
  pub bucket_id: String,
  pub key: String,
  pub value: serde_json::Value,
  #[serde(default)]
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryValueDoc {
  #[serde(default)]
  pub data: Vec<MemoryValueEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryValueEntry {
  pub key: String,
  pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImportDoc {
  #[serde(default)]
  pub data: Vec<StoreImportEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDef {
  pub target_id: String,
  #[serde(default)]
  pub endpoint: String,
  #[serde(default = "default_method")]
  pub method: String,
  #[serde(default)]
  pub headers: HashMap<String, String>,
  #[serde(default)]
  pub query: HashMap<String, String>,
  #[serde(default)]
  pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
  "GET".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRef {
  #[serde(default)]
  pub enabled: bool,
  /// Falls back to the configured default auth when absent.
  #[serde(default)]
  pub auth_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDataDef {
  pub bucket_id: String,
  pub store_key: String,
  pub extractor: ExtractorDef,
  #[serde(default)]
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneExecDoc {
  pub request: RequestDef,
  #[serde(default)]
  pub output: OutputDef,
  #[serde(default)]
  pub auth: AuthRef,
  #[serde(default)]
  pub store_data: Vec<StoreDataDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassExecDoc {
  #[serde(default)]
  pub requests: Vec<MassRequestDef>,
  #[serde(default)]
  pub output: OutputDef,
  #[serde(default)]
  pub auth: AuthRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassRequestDef {
  #[serde(flatten)]
  pub request: RequestDef,
  #[serde(default)]
  pub interval: Option<String>,
  #[serde(default = "default_await_prev")]
  pub await_prev_response: bool,
  /// Termination reasons that count as success, e.g. `count` or `statusCode/ok`.
  #[serde(default)]
  pub success_break: Vec<String>,
  #[serde(default, rename = "break")]
  pub break_on: BreakDef,
  #[serde(default)]
  pub record_exclude_filter: ExcludeFilterDef,
}

fn default_await_prev() -> bool {
  true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakDef {
  #[serde(default)]
  pub time: Option<String>,
  #[serde(default)]
  pub count: Option<u64>,
  #[serde(default)]
  pub sys_error: bool,
  #[serde(default)]
  pub parse_error: bool,
  #[serde(default)]
  pub write_error: bool,
  #[serde(default)]
  pub status_code: Vec<IntConditionDef>,
  #[serde(default)]
  pub response_body: Vec<BodyConditionDef>,
}

/// Responses matching any of these are not written to the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExcludeFilterDef {
  #[serde(default)]
  pub count: Vec<IntConditionDef>,
  #[serde(default)]
  pub status_code: Vec<IntConditionDef>,
  #[serde(default)]
  pub response_body: Vec<BodyConditionDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaveConnectDoc {
  #[serde(default)]
  pub slaves: Vec<SlaveDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveDef {
  pub id: String,
  pub uri: String,
  #[serde(default)]
  pub certificate: CertificateDef,
  #[serde(default)]
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateDef {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub ca_cert: Option<PathBuf>,
  #[serde(default)]
  pub server_name_override: Option<String>,
  #[serde(default)]
  pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowRunnerDoc {
  #[serde(default)]
  pub step: FlowDoc,
}
