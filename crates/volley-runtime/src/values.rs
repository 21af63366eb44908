use dashmap::DashMap;
use serde_json::{Map, Value};

/// Concurrent key/value map that flow execution reads and writes.
///
/// One instance is global to a run; each node gets its own thread-only
/// instance. Readers take a [`snapshot`](ValueStore::snapshot) rather than
/// holding references into the map.
#[derive(Debug, Default)]
pub struct ValueStore {
  values: DashMap<String, Value>,
}

impl ValueStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_map(map: Map<String, Value>) -> Self {
    let store = Self::new();
    store.extend(map);
    store
  }

  pub fn set(&self, key: impl Into<String>, value: Value) {
    self.values.insert(key.into(), value);
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    self.values.get(key).map(|entry| entry.value().clone())
  }

  pub fn extend<I>(&self, entries: I)
  where
    I: IntoIterator<Item = (String, Value)>,
  {
    for (key, value) in entries {
      self.values.insert(key, value);
    }
  }

  /// A stable copy of the current contents.
  pub fn snapshot(&self) -> Map<String, Value> {
    self
      .values
      .iter()
      .map(|entry| (entry.key().clone(), entry.value().clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}
