use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::HostError;

/// Loads raw runner templates by their flow-relative path.
#[async_trait]
pub trait TmplFactor: Send + Sync {
  async fn factorize(&self, path: &str) -> Result<String, HostError>;
}

/// Templates read from a directory on disk.
pub struct FsTemplates {
  base_path: PathBuf,
}

impl FsTemplates {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }
}

#[async_trait]
impl TmplFactor for FsTemplates {
  async fn factorize(&self, path: &str) -> Result<String, HostError> {
    let full = self.base_path.join(path);
    tokio::fs::read_to_string(&full)
      .await
      .map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => HostError::NotFound {
          kind: "template",
          id: path.to_string(),
        },
        _ => HostError::Io { path: full, source },
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_reads_relative_to_base() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("runners")).unwrap();
    std::fs::write(dir.path().join("runners/a.yaml"), "kind: OneExecute").unwrap();

    let templates = FsTemplates::new(dir.path());
    assert_eq!(
      templates.factorize("runners/a.yaml").await.unwrap(),
      "kind: OneExecute"
    );
    assert!(matches!(
      templates.factorize("runners/b.yaml").await,
      Err(HostError::NotFound { .. })
    ));
  }
}
