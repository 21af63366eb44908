use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MatchError;

/// Operators accepted by integer conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntOperator {
  None,
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  In,
  Nin,
  Between,
  NotBetween,
  Regex,
  Mod,
  NotMod,
}

impl IntOperator {
  fn as_str(self) -> &'static str {
    match self {
      IntOperator::None => "none",
      IntOperator::Eq => "eq",
      IntOperator::Ne => "ne",
      IntOperator::Lt => "lt",
      IntOperator::Le => "le",
      IntOperator::Gt => "gt",
      IntOperator::Ge => "ge",
      IntOperator::In => "in",
      IntOperator::Nin => "nin",
      IntOperator::Between => "between",
      IntOperator::NotBetween => "notBetween",
      IntOperator::Regex => "regex",
      IntOperator::Mod => "mod",
      IntOperator::NotMod => "notMod",
    }
  }
}

/// Which integer field a condition applies to. Modulo operators are only
/// meaningful for sequence counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntScope {
  StatusCode,
  Count,
}

impl IntScope {
  fn name(self) -> &'static str {
    match self {
      IntScope::StatusCode => "status code",
      IntScope::Count => "count",
    }
  }
}

/// Declared form of an integer condition, as read from a runner document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntConditionDef {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub op: Option<IntOperator>,
  #[serde(default)]
  pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
enum Predicate {
  Never,
  Eq(i64),
  Ne(i64),
  Lt(i64),
  Le(i64),
  Gt(i64),
  Ge(i64),
  In(Vec<i64>),
  NotIn(Vec<i64>),
  Between(i64, i64),
  NotBetween(i64, i64),
  Regex(Regex),
  Mod(i64),
  NotMod(i64),
}

/// A compiled integer condition.
#[derive(Debug, Clone)]
pub struct IntCondition {
  id: String,
  predicate: Predicate,
}

impl IntCondition {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn matches(&self, value: i64) -> bool {
    match &self.predicate {
      Predicate::Never => false,
      Predicate::Eq(v) => value == *v,
      Predicate::Ne(v) => value != *v,
      Predicate::Lt(v) => value < *v,
      Predicate::Le(v) => value <= *v,
      Predicate::Gt(v) => value > *v,
      Predicate::Ge(v) => value >= *v,
      Predicate::In(set) => set.contains(&value),
      Predicate::NotIn(set) => !set.contains(&value),
      Predicate::Between(min, max) => value >= *min && value <= *max,
      Predicate::NotBetween(min, max) => value < *min || value > *max,
      Predicate::Regex(re) => re.is_match(&value.to_string()),
      Predicate::Mod(v) => value % v == 0,
      Predicate::NotMod(v) => value % v != 0,
    }
  }
}

impl IntConditionDef {
  pub fn compile(&self, scope: IntScope) -> Result<IntCondition, MatchError> {
    let op = self.op.ok_or(MatchError::Missing { field: "op" })?;
    let predicate = match op {
      IntOperator::None => Predicate::Never,
      IntOperator::Eq => Predicate::Eq(self.int_value(op)?),
      IntOperator::Ne => Predicate::Ne(self.int_value(op)?),
      IntOperator::Lt => Predicate::Lt(self.int_value(op)?),
      IntOperator::Le => Predicate::Le(self.int_value(op)?),
      IntOperator::Gt => Predicate::Gt(self.int_value(op)?),
      IntOperator::Ge => Predicate::Ge(self.int_value(op)?),
      IntOperator::In => Predicate::In(self.int_list(op)?),
      IntOperator::Nin => Predicate::NotIn(self.int_list(op)?),
      IntOperator::Between => {
        let (min, max) = self.range(op)?;
        Predicate::Between(min, max)
      }
      IntOperator::NotBetween => {
        let (min, max) = self.range(op)?;
        Predicate::NotBetween(min, max)
      }
      IntOperator::Regex => {
        let pattern = self
          .value()?
          .as_str()
          .ok_or_else(|| invalid(op, "value must be a string"))?;
        let re = Regex::new(pattern).map_err(|source| MatchError::Regex {
          pattern: pattern.to_string(),
          source,
        })?;
        Predicate::Regex(re)
      }
      IntOperator::Mod | IntOperator::NotMod => {
        if scope != IntScope::Count {
          return Err(MatchError::OperatorNotAllowed {
            op: op.as_str().to_string(),
            scope: scope.name(),
          });
        }
        let divisor = self.int_value(op)?;
        if divisor == 0 {
          return Err(invalid(op, "value must be non-zero"));
        }
        if op == IntOperator::Mod {
          Predicate::Mod(divisor)
        } else {
          Predicate::NotMod(divisor)
        }
      }
    };

    Ok(IntCondition {
      id: self.id.clone().unwrap_or_default(),
      predicate,
    })
  }

  fn value(&self) -> Result<&serde_json::Value, MatchError> {
    self.value.as_ref().ok_or(MatchError::Missing { field: "value" })
  }

  fn int_value(&self, op: IntOperator) -> Result<i64, MatchError> {
    self
      .value()?
      .as_i64()
      .ok_or_else(|| invalid(op, "value must be an integer"))
  }

  fn int_list(&self, op: IntOperator) -> Result<Vec<i64>, MatchError> {
    let items = self
      .value()?
      .as_array()
      .ok_or_else(|| invalid(op, "value must be a list of integers"))?;
    items
      .iter()
      .map(|item| {
        item
          .as_i64()
          .ok_or_else(|| invalid(op, "value must be a list of integers"))
      })
      .collect()
  }

  fn range(&self, op: IntOperator) -> Result<(i64, i64), MatchError> {
    let value = self.value()?;
    let bound = |key: &str| {
      value
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| invalid(op, "value must be {min, max} integers"))
    };
    Ok((bound("min")?, bound("max")?))
  }
}

fn invalid(op: IntOperator, message: &str) -> MatchError {
  MatchError::InvalidValue {
    op: op.as_str().to_string(),
    message: message.to_string(),
  }
}

/// An ordered list of integer conditions.
#[derive(Debug, Clone, Default)]
pub struct IntConditions(Vec<IntCondition>);

impl IntConditions {
  pub fn compile(defs: &[IntConditionDef], scope: IntScope) -> Result<Self, MatchError> {
    defs
      .iter()
      .map(|def| def.compile(scope))
      .collect::<Result<Vec<_>, _>>()
      .map(Self)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Identifier of the first matching condition. An unnamed condition yields
  /// an empty identifier.
  pub fn first_match(&self, value: i64) -> Option<&str> {
    self.0.iter().find(|c| c.matches(value)).map(|c| c.id())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn def(id: &str, op: IntOperator, value: serde_json::Value) -> IntConditionDef {
    IntConditionDef {
      id: Some(id.to_string()),
      op: Some(op),
      value: Some(value),
    }
  }

  #[test]
  fn test_first_match_wins() {
    let conditions = IntConditions::compile(
      &[
        def("a", IntOperator::Eq, json!(200)),
        def("b", IntOperator::Eq, json!(200)),
      ],
      IntScope::StatusCode,
    )
    .unwrap();

    assert_eq!(conditions.first_match(200), Some("a"));
    assert_eq!(conditions.first_match(404), None);
  }

  #[test]
  fn test_operators() {
    let cases = [
      (def("", IntOperator::Ne, json!(200)), 201, true),
      (def("", IntOperator::Lt, json!(300)), 299, true),
      (def("", IntOperator::Le, json!(300)), 300, true),
      (def("", IntOperator::Gt, json!(499)), 500, true),
      (def("", IntOperator::Ge, json!(500)), 499, false),
      (def("", IntOperator::In, json!([200, 204])), 204, true),
      (def("", IntOperator::Nin, json!([200, 204])), 204, false),
      (def("", IntOperator::Between, json!({"min": 200, "max": 299})), 299, true),
      (def("", IntOperator::NotBetween, json!({"min": 200, "max": 299})), 200, false),
      (def("", IntOperator::Regex, json!("^5\\d\\d$")), 503, true),
      (def("", IntOperator::None, json!(0)), 0, false),
    ];

    for (def, value, expected) in cases {
      let condition = def.compile(IntScope::StatusCode).unwrap();
      assert_eq!(condition.matches(value), expected, "{:?} on {}", def.op, value);
    }
  }

  #[test]
  fn test_modulo_only_for_count() {
    let every_ten = def("tick", IntOperator::Mod, json!(10));
    assert!(matches!(
      every_ten.compile(IntScope::StatusCode),
      Err(MatchError::OperatorNotAllowed { .. })
    ));

    let condition = every_ten.compile(IntScope::Count).unwrap();
    assert!(condition.matches(20));
    assert!(!condition.matches(21));

    let zero = def("", IntOperator::NotMod, json!(0));
    assert!(zero.compile(IntScope::Count).is_err());
  }

  #[test]
  fn test_missing_fields_and_bad_values() {
    let no_op = IntConditionDef {
      id: Some("x".to_string()),
      op: None,
      value: None,
    };
    assert!(matches!(
      no_op.compile(IntScope::Count),
      Err(MatchError::Missing { field: "op" })
    ));
    assert!(def("", IntOperator::In, json!(5)).compile(IntScope::Count).is_err());
    assert!(def("", IntOperator::Regex, json!("(")).compile(IntScope::Count).is_err());
  }

  #[test]
  fn test_unnamed_condition_yields_empty_id() {
    let conditions = IntConditions::compile(
      &[IntConditionDef {
        id: None,
        op: Some(IntOperator::Ge),
        value: Some(json!(10)),
      }],
      IntScope::Count,
    )
    .unwrap();
    assert_eq!(conditions.first_match(10), Some(""));
  }

  #[test]
  fn test_operator_names_deserialize() {
    let def: IntConditionDef =
      serde_json::from_value(json!({"id": "r", "op": "notBetween", "value": {"min": 1, "max": 2}}))
        .unwrap();
    assert_eq!(def.op, Some(IntOperator::NotBetween));
  }
}
