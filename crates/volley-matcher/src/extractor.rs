use jmespath::Expression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractorKind {
  #[serde(rename = "jmesPath")]
  JmesPath,
}

/// What an extractor yields when the query result is null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnNil {
  Empty,
  #[default]
  Null,
  Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorDef {
  #[serde(default, rename = "type")]
  pub kind: Option<ExtractorKind>,
  #[serde(default)]
  pub jmes_path: Option<String>,
  #[serde(default)]
  pub on_nil: Option<OnNil>,
}

/// A compiled data extractor.
pub struct Extractor {
  expression: Expression<'static>,
  on_nil: OnNil,
}

impl std::fmt::Debug for Extractor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Extractor")
      .field("expression", &self.expression.as_str())
      .field("on_nil", &self.on_nil)
      .finish()
  }
}

impl ExtractorDef {
  pub fn compile(&self) -> Result<Extractor, MatchError> {
    match self.kind.ok_or(MatchError::Missing { field: "type" })? {
      ExtractorKind::JmesPath => {
        let source = self
          .jmes_path
          .as_deref()
          .ok_or(MatchError::Missing { field: "jmes_path" })?;
        let expression = jmespath::compile(source).map_err(|e| MatchError::Compile {
          expression: source.to_string(),
          message: e.to_string(),
        })?;
        Ok(Extractor {
          expression,
          on_nil: self.on_nil.unwrap_or_default(),
        })
      }
    }
  }
}

impl Extractor {
  /// Evaluate the query against `data`.
  pub fn extract(&self, data: &Value) -> Result<Value, MatchError> {
    let result = self
      .expression
      .search(data)
      .map_err(|e| MatchError::Search(e.to_string()))?;

    if result.is_null() {
      return match self.on_nil {
        OnNil::Empty => Ok(Value::String(String::new())),
        OnNil::Null => Ok(Value::Null),
        OnNil::Error => Err(MatchError::NilValue),
      };
    }

    serde_json::to_value(&*result).map_err(|e| MatchError::Search(e.to_string()))
  }
}
