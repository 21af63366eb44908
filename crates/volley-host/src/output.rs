use std::fs::File;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::HostError;

/// Sink for request result records. The first record written is the header.
pub trait RecordWriter: Send {
  fn write(&mut self, record: &[String]) -> Result<(), HostError>;
  fn flush(&mut self) -> Result<(), HostError>;
}

/// Opens record writers for an output id under an executor's output root.
#[async_trait]
pub trait OutputFactor: Send + Sync {
  async fn factorize(
    &self,
    output_id: &str,
    output_root: &str,
  ) -> Result<Box<dyn RecordWriter>, HostError>;
}

/// Writes `<base>/<output_root>/<output_id>.csv`.
pub struct CsvOutputFactor {
  base_path: PathBuf,
}

impl CsvOutputFactor {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }
}

#[async_trait]
impl OutputFactor for CsvOutputFactor {
  async fn factorize(
    &self,
    output_id: &str,
    output_root: &str,
  ) -> Result<Box<dyn RecordWriter>, HostError> {
    let dir = self.base_path.join(output_root);
    tokio::fs::create_dir_all(&dir)
      .await
      .map_err(|source| HostError::Io {
        path: dir.clone(),
        source,
      })?;
    let path = dir.join(format!("{output_id}.csv"));
    let file = File::create(&path).map_err(|source| HostError::Io {
      path: path.clone(),
      source,
    })?;
    debug!(path = %path.display(), "output_opened");
    Ok(Box::new(CsvRecordWriter {
      writer: csv::WriterBuilder::new().flexible(true).from_writer(file),
    }))
  }
}

/// Remove the named output roots under `base_path`, or every entry in it
/// when `roots` is empty. Returns how many entries were removed; missing
/// roots are skipped.
pub async fn clear_outputs(base_path: &Path, roots: &[String]) -> Result<usize, HostError> {
  let targets = if roots.is_empty() {
    let mut targets = Vec::new();
    let mut dir = match tokio::fs::read_dir(base_path).await {
      Ok(dir) => dir,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
      Err(source) => return Err(io_error(base_path)(source)),
    };
    while let Some(entry) = dir.next_entry().await.map_err(io_error(base_path))? {
      targets.push(entry.path());
    }
    targets
  } else {
    let mut targets = Vec::with_capacity(roots.len());
    for root in roots {
      let relative = Path::new(root);
      if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(HostError::InvalidRequest(format!(
          "output root must be a plain relative path: {root}"
        )));
      }
      targets.push(base_path.join(relative));
    }
    targets
  };

  let mut removed = 0;
  for target in targets {
    let result = match tokio::fs::symlink_metadata(&target).await {
      Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
      Ok(_) => tokio::fs::remove_file(&target).await,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
      Err(source) => return Err(io_error(&target)(source)),
    };
    result.map_err(io_error(&target))?;
    debug!(path = %target.display(), "output_cleared");
    removed += 1;
  }
  Ok(removed)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> HostError + use<> {
  let path = path.to_path_buf();
  move |source| HostError::Io { path, source }
}

struct CsvRecordWriter {
  writer: csv::Writer<File>,
}

impl RecordWriter for CsvRecordWriter {
  fn write(&mut self, record: &[String]) -> Result<(), HostError> {
    self
      .writer
      .write_record(record)
      .map_err(|e| HostError::Output(e.to_string()))
  }

  fn flush(&mut self) -> Result<(), HostError> {
    self
      .writer
      .flush()
      .map_err(|e| HostError::Output(e.to_string()))
  }
}
