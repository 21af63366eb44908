use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::MatchError;

/// Why a repeated-request loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminateType {
  Context,
  Count,
  SystemError,
  CreateRequestError,
  ParseError,
  WriteError,
  ResponseBodyWriteFilterError,
  ResponseBodyDataExtractorError,
  ResponseBodyBreakFilterError,
  Time,
  ResponseBody,
  StatusCode,
}

impl TerminateType {
  pub fn as_str(self) -> &'static str {
    match self {
      TerminateType::Context => "context",
      TerminateType::Count => "count",
      TerminateType::SystemError => "sysError",
      TerminateType::CreateRequestError => "createRequestError",
      TerminateType::ParseError => "parseError",
      TerminateType::WriteError => "writeError",
      TerminateType::ResponseBodyWriteFilterError => "responseBodyWriteFilterError",
      TerminateType::ResponseBodyDataExtractorError => "responseBodyDataExtractorError",
      TerminateType::ResponseBodyBreakFilterError => "responseBodyBreakFilterError",
      TerminateType::Time => "time",
      TerminateType::ResponseBody => "responseBody",
      TerminateType::StatusCode => "statusCode",
    }
  }

  /// Whether a rule for this type may narrow itself to specific match ids.
  fn takes_params(self) -> bool {
    matches!(
      self,
      TerminateType::Count
        | TerminateType::ResponseBody
        | TerminateType::StatusCode
        | TerminateType::ResponseBodyWriteFilterError
        | TerminateType::ResponseBodyDataExtractorError
        | TerminateType::ResponseBodyBreakFilterError
    )
  }
}

impl FromStr for TerminateType {
  type Err = MatchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let kind = match s {
      "context" => TerminateType::Context,
      "count" => TerminateType::Count,
      "sysError" => TerminateType::SystemError,
      "createRequestError" => TerminateType::CreateRequestError,
      "parseError" => TerminateType::ParseError,
      "writeError" => TerminateType::WriteError,
      "responseBodyWriteFilterError" => TerminateType::ResponseBodyWriteFilterError,
      "responseBodyDataExtractorError" => TerminateType::ResponseBodyDataExtractorError,
      "responseBodyBreakFilterError" => TerminateType::ResponseBodyBreakFilterError,
      "time" => TerminateType::Time,
      "responseBody" => TerminateType::ResponseBody,
      "statusCode" => TerminateType::StatusCode,
      other => return Err(MatchError::InvalidTerminateType(other.to_string())),
    };
    Ok(kind)
  }
}

impl fmt::Display for TerminateType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The concrete termination of one loop: a type plus the id of the
/// condition that fired (empty when none applies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateReason {
  pub kind: TerminateType,
  pub param: String,
}

impl TerminateReason {
  pub fn new(kind: TerminateType) -> Self {
    Self {
      kind,
      param: String::new(),
    }
  }

  pub fn with_param(kind: TerminateType, param: impl Into<String>) -> Self {
    Self {
      kind,
      param: param.into(),
    }
  }
}

impl fmt::Display for TerminateReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.param.is_empty() {
      write!(f, "{}", self.kind)
    } else {
      write!(f, "{}/{}", self.kind, self.param)
    }
  }
}

/// One accepted termination, written `type` or `type/param1,param2`.
///
/// A rule without params matches every reason of its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateRule {
  pub kind: TerminateType,
  pub params: Option<Vec<String>>,
}

impl TerminateRule {
  pub fn matches(&self, kind: TerminateType, param: &str) -> bool {
    if self.kind != kind {
      return false;
    }
    match &self.params {
      None => true,
      Some(params) => params.iter().any(|p| p == param),
    }
  }
}

impl FromStr for TerminateRule {
  type Err = MatchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut parts = s.split('/');
    let head = parts.next().unwrap_or_default();
    let tail = parts.next();
    // Anything other than exactly one separator means no params.
    let params = match (tail, parts.next()) {
      (Some(list), None) => Some(list.split(',').map(str::to_string).collect()),
      _ => None,
    };

    let kind: TerminateType = head
      .parse()
      .map_err(|_| MatchError::InvalidTerminateType(s.to_string()))?;
    let params = if kind.takes_params() { params } else { None };
    Ok(Self { kind, params })
  }
}

impl<'de> Deserialize<'de> for TerminateRule {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
  }
}

/// A list of accepted terminations; any rule matching means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TerminateRules(pub Vec<TerminateRule>);

impl TerminateRules {
  pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self, MatchError> {
    rules
      .iter()
      .map(|s| s.as_ref().parse())
      .collect::<Result<Vec<_>, _>>()
      .map(Self)
  }

  pub fn matches(&self, reason: &TerminateReason) -> bool {
    self.0.iter().any(|rule| rule.matches(reason.kind, &reason.param))
  }
}
