use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
  #[error("flow node {node}: {field} is required")]
  MissingField { node: String, field: &'static str },

  #[error("duplicate flow id: {0}")]
  DuplicateId(String),

  #[error("flow node {id}: invalid type '{kind}' (expected file, flow or slaveCmd)")]
  InvalidKind { id: String, kind: String },

  #[error("flow node {id}: count must be greater than or equal to 0, got {count}")]
  InvalidCount { id: String, count: i64 },

  #[error("flow node {id} depends on unknown flow {dependency}")]
  UnknownDependency { id: String, dependency: String },
}
