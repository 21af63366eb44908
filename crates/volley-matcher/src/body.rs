use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::MatchError;
use crate::extractor::{Extractor, ExtractorDef};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyConditionDef {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub extractor: Option<ExtractorDef>,
}

/// A body predicate backed by an extractor that should yield a boolean.
#[derive(Debug)]
pub struct BodyCondition {
  id: String,
  extractor: Extractor,
}

impl BodyConditionDef {
  pub fn compile(&self) -> Result<BodyCondition, MatchError> {
    let extractor = self
      .extractor
      .as_ref()
      .ok_or(MatchError::Missing { field: "extractor" })?
      .compile()?;
    Ok(BodyCondition {
      id: self.id.clone().unwrap_or_default(),
      extractor,
    })
  }
}

impl BodyCondition {
  pub fn id(&self) -> &str {
    &self.id
  }

  /// A non-boolean query result never matches.
  pub fn matches(&self, body: &Value) -> Result<bool, MatchError> {
    match self.extractor.extract(body)? {
      Value::Bool(matched) => Ok(matched),
      other => {
        warn!(condition_id = %self.id, result = %other, "body_condition_not_boolean");
        Ok(false)
      }
    }
  }
}

/// An ordered list of body conditions.
#[derive(Debug, Default)]
pub struct BodyConditions(Vec<BodyCondition>);

impl BodyConditions {
  pub fn compile(defs: &[BodyConditionDef]) -> Result<Self, MatchError> {
    defs
      .iter()
      .map(BodyConditionDef::compile)
      .collect::<Result<Vec<_>, _>>()
      .map(Self)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Identifier of the first matching condition.
  ///
  /// An evaluation failure stops the scan and reports the failing
  /// condition's identifier alongside the error.
  pub fn first_match(&self, body: &Value) -> Result<Option<&str>, (&str, MatchError)> {
    for condition in &self.0 {
      match condition.matches(body) {
        Ok(true) => return Ok(Some(condition.id())),
        Ok(false) => {}
        Err(e) => return Err((condition.id(), e)),
      }
    }
    Ok(None)
  }
}
