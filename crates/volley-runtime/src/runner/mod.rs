//! Local execution of one runner file.
//!
//! Pipeline: cast `sys:start`, render, decode the [`RunnerDoc`] header,
//! optionally import store values and re-render, sleep(init), validate and
//! dispatch on the runner kind, then sleep(exec) or sleep(failedExec).

mod mass_exec;
mod request;
mod sleep;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use volley_config::{
  DocumentFormat, FlowRunnerDoc, MassExecDoc, MemoryValueDoc, OneExecDoc, RunnerDoc, RunnerKind,
  SleepAfter, SlaveConnectDoc, StoreImportDoc, StoreImportEntry, StoreValueDoc, parse_document,
};
use volley_event::{Event, EventCaster};
use volley_flow::Flow;
use volley_host::{ImportRequest, StoreEntry};

use crate::error::RuntimeError;
use crate::orchestrator;
use crate::render::{Dynamic, RenderContext, render};
use crate::runtime::Runtime;
use crate::values::ValueStore;

use self::sleep::Sleeps;

/// Everything one execution of a runner file sees.
#[derive(Debug, Clone)]
pub struct Invocation {
  /// Template path handed to the `TmplFactor`.
  pub file: String,
  pub values: Arc<ValueStore>,
  pub thread_values: Arc<ValueStore>,
  pub output_root: String,
  pub loop_count: usize,
  pub call_count: usize,
  pub slave_values: Arc<Map<String, Value>>,
}

impl Invocation {
  pub(crate) fn context(&self) -> RenderContext {
    RenderContext {
      slave_values: (*self.slave_values).clone(),
      values: self.values.snapshot(),
      thread_values: self.thread_values.snapshot(),
      dynamic: Dynamic {
        output_root: self.output_root.clone(),
        loop_count: self.loop_count,
        call_count: self.call_count,
        request_loop_count: None,
      },
    }
  }

  fn format(&self) -> Result<DocumentFormat, RuntimeError> {
    Ok(DocumentFormat::from_path(Path::new(&self.file))?)
  }
}

impl Runtime {
  /// Execute one runner file.
  ///
  /// Cancellation ends the run cleanly; the result is `Ok` unless the runner
  /// failed before `cancel` fired.
  #[instrument(
    name = "runner_execute",
    skip_all,
    fields(file = %invocation.file, loop_count = invocation.loop_count, call_count = invocation.call_count)
  )]
  pub async fn execute(
    &self,
    invocation: &Invocation,
    caster: &dyn EventCaster,
    cancel: &CancellationToken,
  ) -> Result<(), RuntimeError> {
    let _ = caster.cast(Event::Start);

    let template = self
      .collaborators()
      .templates
      .factorize(&invocation.file)
      .await?;
    let format = invocation.format()?;
    let mut rendered = render(&invocation.file, &template, &invocation.context())?;
    let mut header: RunnerDoc = parse_document(&rendered, format, &invocation.file)?;

    if header.store_import.enabled {
      let _ = caster.cast(Event::StoreImporting);
      self
        .import_values(&header.store_import.data, invocation)
        .await?;
      rendered = render(&invocation.file, &template, &invocation.context())?;
      header = parse_document(&rendered, format, &invocation.file)?;
      let _ = caster.cast(Event::StoreImported);
    }

    let sleeps = Sleeps::compile(&header.sleep)?;
    sleeps.wait(SleepAfter::Init, cancel).await;

    let runner = RunnerBody {
      runtime: self,
      invocation,
      template: &template,
      rendered: &rendered,
      format,
      caster,
      cancel,
    };
    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => Ok(()),
      result = runner.dispatch(header.kind) => result,
    };

    match result {
      Ok(()) => {
        info!(kind = ?header.kind, "runner_completed");
        sleeps.wait(SleepAfter::Exec, cancel).await;
        Ok(())
      }
      Err(e) => {
        error!(kind = ?header.kind, error = %e, "runner_failed");
        sleeps.wait(SleepAfter::FailedExec, cancel).await;
        Err(e)
      }
    }
  }

  /// Import store values into the global or thread-only value store.
  async fn import_values(
    &self,
    entries: &[StoreImportEntry],
    invocation: &Invocation,
  ) -> Result<(), RuntimeError> {
    if entries.is_empty() {
      return Ok(());
    }
    let requests = entries
      .iter()
      .map(|entry| ImportRequest {
        bucket_id: entry.bucket_id.clone(),
        store_key: entry.store_key.clone(),
        encrypt: entry.encrypt.clone(),
      })
      .collect();
    let imported = self.collaborators().store.import(requests).await?;

    for (entry, value) in entries.iter().zip(imported) {
      let target = if entry.thread_only {
        &invocation.thread_values
      } else {
        &invocation.values
      };
      target.set(entry.key.clone(), value.value);
    }
    Ok(())
  }
}

/// A rendered runner document ready to be dispatched on its kind.
struct RunnerBody<'a> {
  runtime: &'a Runtime,
  invocation: &'a Invocation,
  template: &'a str,
  rendered: &'a str,
  format: DocumentFormat,
  caster: &'a dyn EventCaster,
  cancel: &'a CancellationToken,
}

impl RunnerBody<'_> {
  /// Decode the kind-specific document between the validation events.
  fn validate<T: DeserializeOwned>(&self) -> Result<T, RuntimeError> {
    let _ = self.caster.cast(Event::Validating);
    let doc = parse_document(self.rendered, self.format, &self.invocation.file)?;
    let _ = self.caster.cast(Event::Validated);
    Ok(doc)
  }

  async fn dispatch(&self, kind: RunnerKind) -> Result<(), RuntimeError> {
    let collaborators = self.runtime.collaborators();
    match kind {
      RunnerKind::StoreValue => {
        let doc: StoreValueDoc = self.validate()?;
        let entries = doc
          .data
          .into_iter()
          .map(|entry| StoreEntry {
            bucket_id: entry.bucket_id,
            store_key: entry.key,
            value: entry.value,
            encrypt: entry.encrypt,
          })
          .collect();
        collaborators.store.store(entries).await?;
      }

      RunnerKind::MemoryValue => {
        let doc: MemoryValueDoc = self.validate()?;
        self
          .invocation
          .values
          .extend(doc.data.into_iter().map(|entry| (entry.key, entry.value)));
      }

      RunnerKind::StoreImport => {
        let doc: StoreImportDoc = self.validate()?;
        self
          .runtime
          .import_values(&doc.data, self.invocation)
          .await?;
      }

      RunnerKind::OneExecute => {
        let doc: OneExecDoc = self.validate()?;
        request::one_execute(collaborators, &self.invocation.file, &self.invocation.output_root, doc)
          .await?;
      }

      RunnerKind::MassExecute => {
        let doc: MassExecDoc = self.validate()?;
        mass_exec::run(
          collaborators,
          self.invocation,
          self.template,
          self.format,
          doc,
          self.cancel,
        )
        .await?;
      }

      RunnerKind::SlaveConnect => {
        let doc: SlaveConnectDoc = self.validate()?;
        self
          .runtime
          .connect_workers(&doc.slaves, self.caster, self.cancel)
          .await?;
      }

      RunnerKind::Flow => {
        let doc: FlowRunnerDoc = self.validate()?;
        let flow = Flow::from_doc(&doc.step)?;
        orchestrator::run(
          self.runtime.clone(),
          &flow,
          self.invocation.values.clone(),
          Path::new(&self.invocation.output_root),
          self.invocation.call_count,
          self.invocation.slave_values.clone(),
          self.cancel.clone(),
        )
        .await?;
      }
    }
    Ok(())
  }
}
