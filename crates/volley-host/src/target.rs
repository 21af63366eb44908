use std::collections::HashMap;

use async_trait::async_trait;
use volley_config::TargetValue;

use crate::error::HostError;

/// Resolves request destinations by id.
#[async_trait]
pub trait TargetFactor: Send + Sync {
  async fn factorize(&self, target_id: &str) -> Result<TargetValue, HostError>;
}

pub struct ConfigTargetFactor {
  targets: HashMap<String, TargetValue>,
}

impl ConfigTargetFactor {
  pub fn new(targets: HashMap<String, TargetValue>) -> Self {
    Self { targets }
  }
}

#[async_trait]
impl TargetFactor for ConfigTargetFactor {
  async fn factorize(&self, target_id: &str) -> Result<TargetValue, HostError> {
    self
      .targets
      .get(target_id)
      .cloned()
      .ok_or_else(|| HostError::NotFound {
        kind: "target",
        id: target_id.to_string(),
      })
  }
}
