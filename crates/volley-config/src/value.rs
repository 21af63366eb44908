use serde::{Deserialize, Serialize};

/// Credential material handed to request execution.
///
/// Tokens are expected to be obtained beforehand; volley only attaches them.
/// Externally tagged so the same shape travels over the binary wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthValue {
  Bearer { token: String },
  Basic { username: String, password: String },
  ApiKey { header_name: String, key: String },
}

/// A named request destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetValue {
  pub url: String,
}

/// A configured symmetric key. AES-GCM; the key must be 16 or 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncrypterValue {
  pub key: String,
}

/// Reference to a registered encrypter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptDef {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub encrypt_id: Option<String>,
}

impl EncryptDef {
  /// The encrypter id when encryption is switched on.
  pub fn active_id(&self) -> Option<&str> {
    if self.enabled {
      self.encrypt_id.as_deref()
    } else {
      None
    }
  }
}
