//! Dispatch of `slaveCmd` nodes to connected workers.
//!
//! Every executor is prepared in declaration order (command registered,
//! context maps pushed), then all of them run concurrently. A command is done
//! once its output stream ends and the worker reports its termination.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use volley_flow::{FlowNode, RemoteExecutor};
use volley_host::{Collaborators, RecordWriter};
use volley_master::Session;
use volley_wire::message::{
  CallExecRequest, ReceiveLoadTermChannelRequest, SlaveCommandDefaultStoreRequest,
  SlaveCommandRequest, StoreKind,
};
use volley_wire::{CHUNK_SIZE, WireError, chunks};

use crate::error::RuntimeError;
use crate::orchestrator::bindings;
use crate::runtime::Runtime;
use crate::values::ValueStore;

/// A command registered on a worker, ready for `CallExec`.
struct Command {
  session: Arc<Session>,
  command_id: String,
  /// Where the worker's records land; `None` discards them.
  output_root: Option<String>,
}

#[allow(clippy::too_many_arguments)]
#[instrument(name = "remote_dispatch", skip_all, fields(flow_id = %node.id, file = %file, executors = executors.len()))]
pub(crate) async fn dispatch(
  runtime: &Runtime,
  node: &FlowNode,
  file: &str,
  executors: &[RemoteExecutor],
  values: &ValueStore,
  thread_values: &ValueStore,
  output_root: &str,
  cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
  let sessions = runtime
    .sessions()
    .ok_or(RuntimeError::SessionsUnavailable)?;

  let mut commands = Vec::with_capacity(executors.len());
  for (index, executor) in executors.iter().enumerate() {
    if cancel.is_cancelled() {
      return Ok(());
    }
    let session =
      sessions
        .find(&executor.slave_id)
        .ok_or_else(|| RuntimeError::WorkerNotConnected {
          worker_id: executor.slave_id.clone(),
        })?;

    let mut global = if executor.inherit_values {
      values.snapshot()
    } else {
      Map::new()
    };
    global.extend(bindings(&executor.additional_values));

    let mut thread = thread_values.snapshot();
    thread.extend(bindings(&executor.additional_thread_only_values));

    let mut slave = Map::new();
    slave.insert("SlaveID".to_string(), Value::from(executor.slave_id.clone()));
    slave.insert("Index".to_string(), Value::from(index));

    let command_root = match &executor.output_path {
      Some(path) => Path::new(output_root)
        .join(path)
        .to_string_lossy()
        .into_owned(),
      None => output_root.to_string(),
    };

    let command_id = prepare(&session, file, &command_root, [
      (StoreKind::Store, global),
      (StoreKind::ThreadOnlyStore, thread),
      (StoreKind::SlaveValues, slave),
    ])
    .await?;
    debug!(worker_id = %executor.slave_id, command_id = %command_id, index, "remote_command_prepared");

    commands.push(Command {
      session,
      command_id,
      output_root: executor.output_path.is_some().then_some(command_root),
    });
  }

  let results = futures::future::join_all(
    commands
      .iter()
      .map(|command| command.run(runtime.collaborators(), cancel)),
  )
  .await;
  results.into_iter().collect()
}

/// Register the command and push its three context maps.
async fn prepare(
  session: &Session,
  file: &str,
  output_root: &str,
  stores: [(StoreKind, Map<String, Value>); 3],
) -> Result<String, RuntimeError> {
  let client = session.client();
  let connection_id = session.connection_id().to_string();

  let response = client
    .slave_command(SlaveCommandRequest {
      connection_id: connection_id.clone(),
      loader_id: file.to_string(),
      output_root: output_root.to_string(),
    })
    .await
    .map_err(remote_error(session, "SlaveCommand"))?;
  let command_id = response.command_id;

  let store_error = remote_error(session, "SlaveCommandDefaultStore");
  let mut stream = client.slave_command_default_store().map_err(store_error)?;
  for (store_kind, map) in stores {
    let payload =
      serde_json::to_vec(&map).map_err(|e| store_error(WireError::Encode(e.to_string())))?;
    for chunk in chunks(&payload, CHUNK_SIZE) {
      stream
        .send(&SlaveCommandDefaultStoreRequest {
          connection_id: connection_id.clone(),
          command_id: command_id.clone(),
          store_kind,
          default_store: chunk.data.to_vec(),
          is_last_chunk: chunk.is_last,
        })
        .map_err(store_error)?;
    }
  }
  stream.close_and_recv().await.map_err(store_error)?;
  Ok(command_id)
}

impl Command {
  fn worker_id(&self) -> &str {
    self.session.worker_id()
  }

  /// Stream the command's output, then wait for its termination signal.
  ///
  /// Cancellation abandons both calls and counts as success.
  async fn run(
    &self,
    collaborators: &Collaborators,
    cancel: &CancellationToken,
  ) -> Result<(), RuntimeError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        debug!(worker_id = %self.worker_id(), command_id = %self.command_id, "remote_command_cancelled");
        Ok(())
      }
      result = self.execute(collaborators) => result,
    }
  }

  async fn execute(&self, collaborators: &Collaborators) -> Result<(), RuntimeError> {
    let client = self.session.client();
    let connection_id = self.session.connection_id().to_string();
    let call_error = remote_error(&self.session, "CallExec");

    let mut stream = client
      .call_exec(CallExecRequest {
        connection_id: connection_id.clone(),
        command_id: self.command_id.clone(),
      })
      .map_err(call_error)?;

    let mut writers: HashMap<(String, String), Box<dyn RecordWriter>> = HashMap::new();
    let mut records = 0usize;
    while let Some(record) = stream.message().await.map_err(call_error)? {
      records += 1;
      if self.output_root.is_none() {
        continue;
      }
      let key = (record.output_root, record.output_id);
      if !writers.contains_key(&key) {
        let writer = collaborators.output.factorize(&key.1, &key.0).await?;
        writers.insert(key.clone(), writer);
      }
      if let Some(writer) = writers.get_mut(&key) {
        writer.write(&record.data)?;
      }
    }
    for ((_, output_id), mut writer) in writers {
      if let Err(e) = writer.flush() {
        warn!(output_id = %output_id, error = %e, "output_flush_failed");
      }
    }

    let term = client
      .receive_load_term_channel(ReceiveLoadTermChannelRequest {
        connection_id,
        command_id: self.command_id.clone(),
      })
      .await
      .map_err(remote_error(&self.session, "ReceiveLoadTermChannel"))?;
    if !term.success {
      return Err(RuntimeError::CommandFailed {
        worker_id: self.worker_id().to_string(),
        command_id: self.command_id.clone(),
      });
    }

    info!(worker_id = %self.worker_id(), command_id = %self.command_id, records, "remote_command_completed");
    Ok(())
  }
}

fn remote_error<'a>(
  session: &'a Session,
  method: &'static str,
) -> impl Fn(WireError) -> RuntimeError + Copy + 'a {
  move |source| RuntimeError::Remote {
    worker_id: session.worker_id().to_string(),
    method,
    source,
  }
}
