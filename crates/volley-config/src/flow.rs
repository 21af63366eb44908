use serde::{Deserialize, Serialize};

/// A flow file: a concurrency policy and the nodes it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDoc {
  /// Negative runs every node at once, zero runs them in order.
  #[serde(default)]
  pub concurrency: Option<i64>,
  #[serde(default)]
  pub flows: Vec<FlowStepDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStepDef {
  #[serde(default)]
  pub id: Option<String>,
  /// `file`, `flow` or `slaveCmd`.
  #[serde(default, rename = "type")]
  pub kind: Option<String>,
  #[serde(default)]
  pub file: Option<String>,
  #[serde(default)]
  pub count: Option<i64>,
  #[serde(default)]
  pub mkdir: bool,
  #[serde(default)]
  pub concurrency: Option<i64>,
  #[serde(default)]
  pub flows: Vec<FlowStepDef>,
  #[serde(default)]
  pub depends_on: Vec<DependsOnDef>,
  #[serde(default)]
  pub values: Vec<ValueDef>,
  #[serde(default)]
  pub thread_only_values: Vec<ValueDef>,
  #[serde(default)]
  pub executors: Vec<ExecutorDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOnDef {
  #[serde(default)]
  pub flow: Option<String>,
  #[serde(default)]
  pub event: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueDef {
  #[serde(default)]
  pub key: Option<String>,
  #[serde(default)]
  pub value: Option<serde_json::Value>,
}

/// One worker a `slaveCmd` node dispatches to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDef {
  #[serde(default)]
  pub slave_id: Option<String>,
  #[serde(default)]
  pub output: ExecutorOutputDef,
  #[serde(default)]
  pub inherit_values: bool,
  #[serde(default)]
  pub additional_values: Vec<ValueDef>,
  #[serde(default)]
  pub additional_thread_only_values: Vec<ValueDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOutputDef {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub root_path: Option<String>,
}
