use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
  Yaml,
  Json,
}

impl DocumentFormat {
  pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
    match path.extension().and_then(|ext| ext.to_str()) {
      Some("yaml") | Some("yml") => Ok(DocumentFormat::Yaml),
      Some("json") => Ok(DocumentFormat::Json),
      other => Err(ConfigError::UnsupportedFormat(
        other.unwrap_or_default().to_string(),
      )),
    }
  }
}

/// Read and decode a document, choosing the format from the extension.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
  let format = DocumentFormat::from_path(path)?;
  let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  parse_document(&contents, format, &path.display().to_string())
}

/// Decode a document from text. `origin` names the source in errors.
pub fn parse_document<T: DeserializeOwned>(
  contents: &str,
  format: DocumentFormat,
  origin: &str,
) -> Result<T, ConfigError> {
  let parsed = match format {
    DocumentFormat::Yaml => serde_yaml_bw::from_str::<T>(contents).map_err(|e| e.to_string()),
    DocumentFormat::Json => serde_json::from_str::<T>(contents).map_err(|e| e.to_string()),
  };
  parsed.map_err(|message| ConfigError::Parse {
    origin: origin.to_string(),
    message,
  })
}

/// Encode a document as text.
pub fn render_document<T: Serialize>(
  value: &T,
  format: DocumentFormat,
) -> Result<String, ConfigError> {
  let rendered = match format {
    DocumentFormat::Yaml => serde_yaml_bw::to_string(value).map_err(|e| e.to_string()),
    DocumentFormat::Json => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
  };
  rendered.map_err(ConfigError::Render)
}
