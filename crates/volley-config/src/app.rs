use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::value::{AuthValue, EncryptDef, EncrypterValue, TargetValue};

/// Process-level settings shared by the `run` and `worker` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
  /// Master and worker refuse to pair when these differ.
  #[serde(default = "default_environment")]
  pub environment: String,
  #[serde(default)]
  pub loader: LoaderConfig,
  #[serde(default)]
  pub output: OutputConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub targets: HashMap<String, TargetValue>,
  #[serde(default)]
  pub auths: HashMap<String, AuthValue>,
  #[serde(default)]
  pub default_auth: Option<String>,
  /// Keys the store and the worker transport may select by id.
  #[serde(default)]
  pub encrypters: HashMap<String, EncrypterValue>,
  #[serde(default)]
  pub worker: WorkerConfig,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      environment: default_environment(),
      loader: LoaderConfig::default(),
      output: OutputConfig::default(),
      store: StoreConfig::default(),
      targets: HashMap::new(),
      auths: HashMap::new(),
      default_auth: None,
      encrypters: HashMap::new(),
      worker: WorkerConfig::default(),
    }
  }
}

fn default_environment() -> String {
  "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
  /// Root directory runner files are resolved against.
  pub base_path: PathBuf,
}

impl Default for LoaderConfig {
  fn default() -> Self {
    Self {
      base_path: PathBuf::from("."),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
  pub base_path: PathBuf,
}

impl Default for OutputConfig {
  fn default() -> Self {
    Self {
      base_path: PathBuf::from("output"),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
  /// JSON snapshot loaded at start and written back on shutdown.
  #[serde(default)]
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
  #[serde(default = "default_worker_address")]
  pub address: String,
  #[serde(default)]
  pub tls: Option<ServerTlsDef>,
  #[serde(default)]
  pub encrypt: EncryptDef,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      address: default_worker_address(),
      tls: None,
      encrypt: EncryptDef::default(),
    }
  }
}

fn default_worker_address() -> String {
  "0.0.0.0:50051".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerTlsDef {
  pub cert: PathBuf,
  pub key: PathBuf,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{DocumentFormat, parse_document};

  #[test]
  fn test_defaults_fill_missing_sections() {
    let config: AppConfig = parse_document("environment: staging\n", DocumentFormat::Yaml, "test").unwrap();
    assert_eq!(config.environment, "staging");
    assert_eq!(config.worker.address, "0.0.0.0:50051");
    assert!(config.targets.is_empty());
  }

  #[test]
  fn test_auth_and_target_values() {
    let yaml = r#"
targets:
  api:
    url: http://localhost:8080
auths:
  main:
    bearer:
      token: abc
  key:
    apiKey:
      header_name: X-Api-Key
      key: secret
default_auth: main
"#;
    let config: AppConfig = parse_document(yaml, DocumentFormat::Yaml, "test").unwrap();
    assert_eq!(config.targets["api"].url, "http://localhost:8080");
    assert_eq!(
      config.auths["main"],
      AuthValue::Bearer {
        token: "abc".to_string()
      }
    );
    assert!(matches!(config.auths["key"], AuthValue::ApiKey { .. }));
    assert_eq!(config.default_auth.as_deref(), Some("main"));
  }

  #[test]
  fn test_encrypters_and_worker_encryption() {
    let yaml = r#"
encrypters:
  wire:
    key: 0123456789abcdef0123456789abcdef
worker:
  encrypt:
    enabled: true
    encrypt_id: wire
"#;
    let config: AppConfig = parse_document(yaml, DocumentFormat::Yaml, "test").unwrap();
    assert_eq!(config.encrypters["wire"].key.len(), 32);
    assert_eq!(config.worker.encrypt.active_id(), Some("wire"));
  }
}
