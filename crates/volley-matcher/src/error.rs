use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
  #[error("{field} is required")]
  Missing { field: &'static str },

  #[error("invalid value for operator '{op}': {message}")]
  InvalidValue { op: String, message: String },

  #[error("operator '{op}' is not allowed for {scope}")]
  OperatorNotAllowed { op: String, scope: &'static str },

  #[error("invalid regex '{pattern}': {source}")]
  Regex {
    pattern: String,
    #[source]
    source: regex::Error,
  },

  #[error("failed to compile jmespath '{expression}': {message}")]
  Compile { expression: String, message: String },

  #[error("failed to search jmespath: {0}")]
  Search(String),

  #[error("extractor returned nil")]
  NilValue,

  #[error("invalid terminate type: {0}")]
  InvalidTerminateType(String),
}
