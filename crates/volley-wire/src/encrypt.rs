use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ring::aead::{AES_128_GCM, AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use serde::de::DeserializeOwned;
use volley_config::{EncryptDef, EncrypterValue};

use crate::error::WireError;

/// Symmetric transform applied to message payloads and stored values.
pub trait Encrypter: Send + Sync {
  fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, WireError>;
  fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, WireError>;
}

/// Encrypters available to a process, keyed by the id configuration refers to.
#[derive(Clone, Default)]
pub struct EncrypterRegistry {
  entries: HashMap<String, Arc<dyn Encrypter>>,
}

impl EncrypterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// One [`AeadEncrypter`] per configured key.
  pub fn from_config(encrypters: &HashMap<String, EncrypterValue>) -> Result<Self, WireError> {
    let mut registry = Self::new();
    for (id, value) in encrypters {
      let encrypter = AeadEncrypter::new(value.key.as_bytes())
        .map_err(|e| WireError::Encryption(format!("encrypter {id}: {e}")))?;
      registry.register(id.clone(), Arc::new(encrypter));
    }
    Ok(registry)
  }

  pub fn register(&mut self, id: impl Into<String>, encrypter: Arc<dyn Encrypter>) {
    self.entries.insert(id.into(), encrypter);
  }

  pub fn get(&self, id: &str) -> Result<Arc<dyn Encrypter>, WireError> {
    self
      .entries
      .get(id)
      .cloned()
      .ok_or_else(|| WireError::UnknownEncrypter(id.to_string()))
  }

  /// The encrypter an [`EncryptDef`] selects, if it is enabled.
  pub fn resolve(&self, def: &EncryptDef) -> Result<Option<Arc<dyn Encrypter>>, WireError> {
    match (def.enabled, def.encrypt_id.as_deref()) {
      (false, _) => Ok(None),
      (true, Some(id)) => self.get(id).map(Some),
      (true, None) => Err(WireError::UnknownEncrypter(String::new())),
    }
  }
}

impl fmt::Debug for EncrypterRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EncrypterRegistry")
      .field("ids", &self.entries.keys().collect::<Vec<_>>())
      .finish()
  }
}

/// AES-GCM with a random nonce per message. Output is `nonce || sealed || tag`.
///
/// The cipher is picked from the key length: 16 bytes for AES-128, 32 for
/// AES-256.
pub struct AeadEncrypter {
  key: LessSafeKey,
  rng: SystemRandom,
}

impl AeadEncrypter {
  pub fn new(key: &[u8]) -> Result<Self, WireError> {
    let algorithm = match key.len() {
      16 => &AES_128_GCM,
      32 => &AES_256_GCM,
      n => {
        return Err(WireError::Encryption(format!(
          "key must be 16 or 32 bytes, got {n}"
        )));
      }
    };
    let key = UnboundKey::new(algorithm, key)
      .map_err(|_| WireError::Encryption("invalid key".to_string()))?;
    Ok(Self {
      key: LessSafeKey::new(key),
      rng: SystemRandom::new(),
    })
  }
}

impl Encrypter for AeadEncrypter {
  fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut nonce = [0u8; NONCE_LEN];
    self
      .rng
      .fill(&mut nonce)
      .map_err(|_| WireError::Encryption("nonce generation failed".to_string()))?;

    let mut sealed = plain.to_vec();
    self
      .key
      .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
      .map_err(|_| WireError::Encryption("seal failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
  }

  fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, WireError> {
    if cipher.len() < NONCE_LEN {
      return Err(WireError::Encryption("ciphertext too short".to_string()));
    }
    let (nonce, sealed) = cipher.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce)
      .map_err(|_| WireError::Encryption("bad nonce".to_string()))?;

    let mut buf = sealed.to_vec();
    let plain = self
      .key
      .open_in_place(nonce, Aad::empty(), &mut buf)
      .map_err(|_| WireError::Encryption("authentication failed".to_string()))?;
    Ok(plain.to_vec())
  }
}

/// Message body codec: bincode, then the optional encrypter.
#[derive(Clone, Default)]
pub struct Payload {
  encrypter: Option<Arc<dyn Encrypter>>,
}

impl Payload {
  pub fn new(encrypter: Option<Arc<dyn Encrypter>>) -> Self {
    Self { encrypter }
  }

  pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, WireError> {
    let bytes = bincode::serialize(message).map_err(|e| WireError::Encode(e.to_string()))?;
    match &self.encrypter {
      Some(encrypter) => encrypter.encrypt(&bytes),
      None => Ok(bytes),
    }
  }

  pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, WireError> {
    let plain = match &self.encrypter {
      Some(encrypter) => encrypter.decrypt(bytes)?,
      None => bytes.to_vec(),
    };
    bincode::deserialize(&plain).map_err(|e| WireError::Decode(e.to_string()))
  }
}
