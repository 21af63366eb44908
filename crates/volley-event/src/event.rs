use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tags emitted by a flow node over its broadcaster.
///
/// Dependents name these in `depends_on` by their string form. Unknown tags
/// parse to [`Event::Custom`]; the core never emits those.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Event {
  Start,
  StoreImporting,
  StoreImported,
  Validating,
  Validated,
  Terminated,
  SlaveConnecting,
  SlaveConnected,
  Custom(String),
}

impl Event {
  pub fn as_str(&self) -> &str {
    match self {
      Event::Start => "sys:start",
      Event::StoreImporting => "sys:store:importing",
      Event::StoreImported => "sys:store:imported",
      Event::Validating => "sys:validating",
      Event::Validated => "sys:validated",
      Event::Terminated => "sys:terminated",
      Event::SlaveConnecting => "slaveConnect:connecting",
      Event::SlaveConnected => "slaveConnect:connected",
      Event::Custom(tag) => tag,
    }
  }
}

impl From<String> for Event {
  fn from(tag: String) -> Self {
    match tag.as_str() {
      "sys:start" => Event::Start,
      "sys:store:importing" => Event::StoreImporting,
      "sys:store:imported" => Event::StoreImported,
      "sys:validating" => Event::Validating,
      "sys:validated" => Event::Validated,
      "sys:terminated" => Event::Terminated,
      "slaveConnect:connecting" => Event::SlaveConnecting,
      "slaveConnect:connected" => Event::SlaveConnected,
      _ => Event::Custom(tag),
    }
  }
}

impl From<Event> for String {
  fn from(event: Event) -> Self {
    event.as_str().to_string()
  }
}

impl FromStr for Event {
  type Err = Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Event::from(s.to_string()))
  }
}

impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_known_tags_round_trip() {
    for event in [
      Event::Start,
      Event::StoreImporting,
      Event::StoreImported,
      Event::Validating,
      Event::Validated,
      Event::Terminated,
      Event::SlaveConnecting,
      Event::SlaveConnected,
    ] {
      let parsed: Event = event.as_str().parse().unwrap();
      assert_eq!(parsed, event);
    }
  }

  #[test]
  fn test_unknown_tag_is_custom() {
    let event: Event = serde_json::from_str("\"user:done\"").unwrap();
    assert_eq!(event, Event::Custom("user:done".to_string()));
    assert_eq!(serde_json::to_string(&Event::Terminated).unwrap(), "\"sys:terminated\"");
  }
}
