use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use volley_config::EncryptDef;
use volley_matcher::Extractor;
use volley_wire::EncrypterRegistry;

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
  pub bucket_id: String,
  pub store_key: String,
  pub value: Value,
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
  pub bucket_id: String,
  pub store_key: String,
  pub encrypt: EncryptDef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedValue {
  pub bucket_id: String,
  pub store_key: String,
  pub value: Value,
}

/// A value to persist after pulling it out of a response body.
#[derive(Debug, Clone)]
pub struct ExtractorEntry {
  pub bucket_id: String,
  pub store_key: String,
  pub extractor: Arc<Extractor>,
  pub encrypt: EncryptDef,
}

/// Bucketed key/value persistence.
#[async_trait]
pub trait Store: Send + Sync {
  async fn store(&self, entries: Vec<StoreEntry>) -> Result<(), HostError>;

  /// Extract each entry's value from `data`, then store them together.
  async fn store_with_extractor(
    &self,
    data: &Value,
    entries: &[ExtractorEntry],
  ) -> Result<(), HostError> {
    let mut extracted = Vec::with_capacity(entries.len());
    for entry in entries {
      let value = entry
        .extractor
        .extract(data)
        .map_err(|source| HostError::Extract {
          store_key: entry.store_key.clone(),
          source,
        })?;
      extracted.push(StoreEntry {
        bucket_id: entry.bucket_id.clone(),
        store_key: entry.store_key.clone(),
        value,
        encrypt: entry.encrypt.clone(),
      });
    }
    self.store(extracted).await
  }

  /// Fetch every requested value. A missing value is an error.
  async fn import(&self, requests: Vec<ImportRequest>) -> Result<Vec<ImportedValue>, HostError>;
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
  bucket_id: String,
  store_key: String,
  data: Vec<u8>,
}

/// In-process store with an optional JSON snapshot on disk.
///
/// Values are kept as JSON bytes, encrypted when the entry asks for it.
pub struct MemoryStore {
  values: DashMap<(String, String), Vec<u8>>,
  encrypters: EncrypterRegistry,
}

impl MemoryStore {
  pub fn new(encrypters: EncrypterRegistry) -> Self {
    Self {
      values: DashMap::new(),
      encrypters,
    }
  }

  /// Load a snapshot written by [`MemoryStore::save`]. A missing file yields
  /// an empty store.
  pub async fn load(path: &Path, encrypters: EncrypterRegistry) -> Result<Self, HostError> {
    let store = Self::new(encrypters);
    let contents = match tokio::fs::read(path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
      Err(source) => {
        return Err(HostError::Io {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    let snapshot: Vec<StoredValue> =
      serde_json::from_slice(&contents).map_err(|e| HostError::Encoding(e.to_string()))?;
    for value in snapshot {
      store
        .values
        .insert((value.bucket_id, value.store_key), value.data);
    }
    debug!(path = %path.display(), entries = store.values.len(), "store_loaded");
    Ok(store)
  }

  pub async fn save(&self, path: &Path) -> Result<(), HostError> {
    let snapshot: Vec<StoredValue> = self
      .values
      .iter()
      .map(|entry| StoredValue {
        bucket_id: entry.key().0.clone(),
        store_key: entry.key().1.clone(),
        data: entry.value().clone(),
      })
      .collect();
    let bytes = serde_json::to_vec(&snapshot).map_err(|e| HostError::Encoding(e.to_string()))?;
    tokio::fs::write(path, bytes)
      .await
      .map_err(|source| HostError::Io {
        path: path.to_path_buf(),
        source,
      })
  }

  /// Bucket ids with their entry counts, sorted by id.
  pub fn buckets(&self) -> Vec<(String, usize)> {
    let mut counts = std::collections::BTreeMap::<String, usize>::new();
    for entry in self.values.iter() {
      *counts.entry(entry.key().0.clone()).or_default() += 1;
    }
    counts.into_iter().collect()
  }

  /// Keys stored in `bucket_id`, sorted.
  pub fn keys(&self, bucket_id: &str) -> Vec<String> {
    let mut keys: Vec<String> = self
      .values
      .iter()
      .filter(|entry| entry.key().0 == bucket_id)
      .map(|entry| entry.key().1.clone())
      .collect();
    keys.sort();
    keys
  }

  pub fn remove(&self, bucket_id: &str, store_key: &str) -> bool {
    self
      .values
      .remove(&(bucket_id.to_string(), store_key.to_string()))
      .is_some()
  }

  /// Drop one bucket, or everything when `bucket_id` is `None`. Returns the
  /// number of entries removed.
  pub fn clear(&self, bucket_id: Option<&str>) -> usize {
    let before = self.values.len();
    match bucket_id {
      Some(bucket_id) => self.values.retain(|key, _| key.0 != bucket_id),
      None => self.values.clear(),
    }
    before - self.values.len()
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn store(&self, entries: Vec<StoreEntry>) -> Result<(), HostError> {
    for entry in entries {
      let mut bytes =
        serde_json::to_vec(&entry.value).map_err(|e| HostError::Encoding(e.to_string()))?;
      if let Some(encrypter) = self.encrypters.resolve(&entry.encrypt)? {
        bytes = encrypter.encrypt(&bytes)?;
      }
      self
        .values
        .insert((entry.bucket_id, entry.store_key), bytes);
    }
    Ok(())
  }

  async fn import(&self, requests: Vec<ImportRequest>) -> Result<Vec<ImportedValue>, HostError> {
    let mut imported = Vec::with_capacity(requests.len());
    for request in requests {
      let key = (request.bucket_id, request.store_key);
      let mut bytes = self
        .values
        .get(&key)
        .map(|v| v.value().clone())
        .ok_or_else(|| HostError::NotFound {
          kind: "store value",
          id: format!("{}/{}", key.0, key.1),
        })?;
      if let Some(encrypter) = self.encrypters.resolve(&request.encrypt)? {
        bytes = encrypter.decrypt(&bytes)?;
      }
      let value = serde_json::from_slice(&bytes).map_err(|e| HostError::Encoding(e.to_string()))?;
      imported.push(ImportedValue {
        bucket_id: key.0,
        store_key: key.1,
        value,
      });
    }
    Ok(imported)
  }
}
