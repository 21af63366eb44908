use std::collections::HashMap;

use async_trait::async_trait;
use volley_config::AuthValue;

use crate::error::HostError;

/// Resolves credentials by id.
#[async_trait]
pub trait AuthFactor: Send + Sync {
  /// Look up `auth_id`, or the configured default when `is_default` is set.
  async fn factorize(&self, auth_id: &str, is_default: bool) -> Result<AuthValue, HostError>;

  /// Whether `auth_id` names the configured default.
  fn is_default(&self, auth_id: &str) -> bool;
}

/// Credentials read from the application config.
pub struct ConfigAuthFactor {
  auths: HashMap<String, AuthValue>,
  default_id: Option<String>,
}

impl ConfigAuthFactor {
  pub fn new(auths: HashMap<String, AuthValue>, default_id: Option<String>) -> Self {
    Self { auths, default_id }
  }
}

#[async_trait]
impl AuthFactor for ConfigAuthFactor {
  async fn factorize(&self, auth_id: &str, is_default: bool) -> Result<AuthValue, HostError> {
    let id = if is_default {
      self.default_id.as_deref().ok_or_else(|| HostError::NotFound {
        kind: "default auth",
        id: auth_id.to_string(),
      })?
    } else {
      auth_id
    };
    self.auths.get(id).cloned().ok_or_else(|| HostError::NotFound {
      kind: "auth",
      id: id.to_string(),
    })
  }

  fn is_default(&self, auth_id: &str) -> bool {
    self.default_id.as_deref() == Some(auth_id)
  }
}
