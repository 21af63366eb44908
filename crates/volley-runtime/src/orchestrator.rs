//! Flow orchestration.
//!
//! One [`EventRegistry`] is built per top-level run: a broadcaster for every
//! node id in the tree and, for every node, a latch subscribed up front to
//! the events it depends on. Nodes are then expanded into executors and run
//! either sequentially (concurrency 0) or as a cohort bounded by a semaphore
//! (positive N) or by nothing but the cohort size (negative).
//!
//! Every executor casts `sys:terminated` on its own broadcaster when it ends,
//! whether it succeeded, failed or was cancelled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use volley_event::{BroadcastCaster, Broadcaster, Event, EventCaster, Subscription};
use volley_flow::{Binding, Executor, Flow, FlowError, FlowNode, NodeKind};

use crate::error::RuntimeError;
use crate::remote;
use crate::runner::Invocation;
use crate::runtime::Runtime;
use crate::values::ValueStore;

/// Broadcasters and dependency latches for one run, keyed by node id.
pub struct EventRegistry {
  broadcasters: HashMap<String, Arc<Broadcaster<Event>>>,
  latches: HashMap<String, Arc<Latch>>,
}

impl EventRegistry {
  /// Build the registry for every node of `flow`, nested flows included.
  ///
  /// Fails if a node depends on an id that does not exist in the tree.
  pub fn build(flow: &Flow) -> Result<Self, FlowError> {
    let nodes = flow.walk();
    let broadcasters: HashMap<String, Arc<Broadcaster<Event>>> = nodes
      .iter()
      .map(|node| (node.id.clone(), Arc::new(Broadcaster::new())))
      .collect();

    let mut latches = HashMap::with_capacity(nodes.len());
    for node in &nodes {
      let mut waits = Vec::with_capacity(node.depends_on.len());
      for dependency in &node.depends_on {
        let broadcaster =
          broadcasters
            .get(&dependency.flow_id)
            .ok_or_else(|| FlowError::UnknownDependency {
              id: node.id.clone(),
              dependency: dependency.flow_id.clone(),
            })?;
        waits.push(Wait {
          flow_id: dependency.flow_id.clone(),
          event: dependency.event.clone(),
          subscription: broadcaster.subscribe(),
          broadcaster: broadcaster.clone(),
        });
      }
      latches.insert(node.id.clone(), Arc::new(Latch::new(waits)));
    }

    Ok(Self {
      broadcasters,
      latches,
    })
  }

  fn caster(&self, node_id: &str) -> Arc<dyn EventCaster> {
    match self.broadcasters.get(node_id) {
      Some(broadcaster) => Arc::new(BroadcastCaster::new(node_id, broadcaster.clone())),
      None => Arc::new(volley_event::NoopCaster),
    }
  }

  fn latch(&self, node_id: &str) -> Option<Arc<Latch>> {
    self.latches.get(node_id).cloned()
  }
}

struct Wait {
  flow_id: String,
  event: Event,
  subscription: Subscription<Event>,
  broadcaster: Arc<Broadcaster<Event>>,
}

impl Wait {
  async fn observed(&mut self) -> bool {
    while let Some(event) = self.subscription.recv().await {
      if event == self.event {
        return true;
      }
    }
    false
  }
}

/// Blocks a node until every dependency has cast its declared event.
///
/// Shared by all executors of the node; once satisfied it stays open and its
/// subscriptions are released.
struct Latch {
  pending: tokio::sync::Mutex<Option<Vec<Wait>>>,
}

impl Latch {
  fn new(waits: Vec<Wait>) -> Self {
    Self {
      pending: tokio::sync::Mutex::new(Some(waits)),
    }
  }

  /// Returns `false` if `cancel` fired or a dependency's broadcaster closed
  /// first.
  async fn wait(&self, cancel: &CancellationToken) -> bool {
    let mut pending = tokio::select! {
      _ = cancel.cancelled() => return false,
      pending = self.pending.lock() => pending,
    };
    let Some(waits) = pending.as_mut() else {
      return true;
    };

    let satisfied = tokio::select! {
      _ = cancel.cancelled() => false,
      observed = futures::future::join_all(waits.iter_mut().map(Wait::observed)) => {
        observed.into_iter().all(|ok| ok)
      }
    };
    if satisfied && let Some(waits) = pending.take() {
      for wait in waits {
        debug!(flow_id = %wait.flow_id, event = %wait.event, "dependency_satisfied");
        wait.broadcaster.unsubscribe(wait.subscription);
      }
    }
    satisfied
  }
}

/// State every executor of one run shares.
#[derive(Clone)]
struct Scope {
  runtime: Runtime,
  registry: Arc<EventRegistry>,
  values: Arc<ValueStore>,
  call_count: usize,
  slave_values: Arc<Map<String, Value>>,
}

/// Run `flow` with a fresh registry.
#[instrument(
  name = "flow_run",
  skip_all,
  fields(nodes = flow.nodes.len(), concurrency = flow.concurrency, call_count = call_count)
)]
pub(crate) async fn run(
  runtime: Runtime,
  flow: &Flow,
  values: Arc<ValueStore>,
  output_root: &Path,
  call_count: usize,
  slave_values: Arc<Map<String, Value>>,
  cancel: CancellationToken,
) -> Result<(), RuntimeError> {
  let registry = Arc::new(EventRegistry::build(flow)?);
  let scope = Scope {
    runtime,
    registry,
    values,
    call_count,
    slave_values,
  };

  info!("flow_started");
  let result = run_nodes(
    scope,
    flow.nodes.clone(),
    flow.concurrency,
    output_root.to_path_buf(),
    cancel,
  )
  .await;
  match &result {
    Ok(()) => info!("flow_completed"),
    Err(e) => error!(error = %e, "flow_failed"),
  }
  result
}

fn run_nodes(
  scope: Scope,
  nodes: Vec<Arc<FlowNode>>,
  concurrency: i64,
  output_root: PathBuf,
  cancel: CancellationToken,
) -> BoxFuture<'static, Result<(), RuntimeError>> {
  async move {
    // Declared values of every node land before any executor of the cohort
    // runs, once per node.
    for node in &nodes {
      scope.values.extend(bindings(&node.values));
    }
    let executors: Vec<Executor> = nodes
      .iter()
      .flat_map(|node| node.expand(&output_root))
      .collect();

    if concurrency == 0 {
      run_sequential(scope, executors, cancel).await
    } else {
      let limit = if concurrency < 0 {
        executors.len()
      } else {
        usize::try_from(concurrency).unwrap_or(usize::MAX)
      };
      run_concurrent(scope, executors, limit.max(1), cancel).await
    }
  }
  .boxed()
}

async fn run_sequential(
  scope: Scope,
  executors: Vec<Executor>,
  cancel: CancellationToken,
) -> Result<(), RuntimeError> {
  for executor in executors {
    if !wait_dependencies(&scope, &executor.node, &cancel).await {
      return Ok(());
    }
    let result = run_executor(&scope, &executor, &cancel).await;
    let _ = scope.registry.caster(&executor.node.id).cast(Event::Terminated);
    result?;
  }
  Ok(())
}

async fn run_concurrent(
  scope: Scope,
  executors: Vec<Executor>,
  limit: usize,
  cancel: CancellationToken,
) -> Result<(), RuntimeError> {
  let cohort = cancel.child_token();
  let semaphore = Arc::new(Semaphore::new(limit));
  let first_error = Arc::new(FirstError::default());
  let mut tasks = JoinSet::new();

  for executor in executors {
    let scope = scope.clone();
    let cohort = cohort.clone();
    let semaphore = semaphore.clone();
    let first_error = first_error.clone();

    tasks.spawn(async move {
      let _terminated = Terminated(scope.registry.caster(&executor.node.id));
      if !wait_dependencies(&scope, &executor.node, &cohort).await {
        return;
      }
      let _permit = tokio::select! {
        _ = cohort.cancelled() => return,
        permit = semaphore.acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => return,
        },
      };
      if let Err(e) = run_executor(&scope, &executor, &cohort).await
        && first_error.record(e)
      {
        cohort.cancel();
      }
    });
  }

  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      warn!(error = %e, "executor_task_failed");
      if first_error.record(RuntimeError::Join(e.to_string())) {
        cohort.cancel();
      }
    }
  }

  first_error.take().map_or(Ok(()), Err)
}

async fn wait_dependencies(scope: &Scope, node: &FlowNode, cancel: &CancellationToken) -> bool {
  match scope.registry.latch(&node.id) {
    Some(latch) => latch.wait(cancel).await,
    None => !cancel.is_cancelled(),
  }
}

/// Run one executor to completion. Errors carry the node id.
#[instrument(
  name = "flow_node",
  skip_all,
  fields(flow_id = %executor.node.id, index = executor.index, kind = executor.node.kind.name())
)]
async fn run_executor(
  scope: &Scope,
  executor: &Executor,
  cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
  let node = &executor.node;
  let thread_values = Arc::new(ValueStore::new());
  thread_values.extend(bindings(&node.thread_only_values));
  if node.mkdir {
    tokio::fs::create_dir_all(&executor.output_root)
      .await
      .map_err(|source| {
        RuntimeError::node(&node.id, RuntimeError::Io {
          path: executor.output_root.clone(),
          source,
        })
      })?;
  }
  let output_root = executor.output_root.to_string_lossy().into_owned();

  info!("flow_node_started");
  let result = match &node.kind {
    NodeKind::LocalFile { file } => {
      let invocation = Invocation {
        file: file.clone(),
        values: scope.values.clone(),
        thread_values,
        output_root,
        loop_count: executor.index,
        call_count: scope.call_count + 1,
        slave_values: scope.slave_values.clone(),
      };
      let caster = scope.registry.caster(&node.id);
      scope
        .runtime
        .execute(&invocation, caster.as_ref(), cancel)
        .await
    }
    NodeKind::NestedFlow {
      concurrency,
      children,
    } => {
      let nested = Scope {
        call_count: scope.call_count + 1,
        ..scope.clone()
      };
      run_nodes(
        nested,
        children.clone(),
        *concurrency,
        executor.output_root.clone(),
        cancel.clone(),
      )
      .await
    }
    NodeKind::RemoteCommand { file, executors } => {
      remote::dispatch(
        &scope.runtime,
        node,
        file,
        executors,
        &scope.values,
        &thread_values,
        &output_root,
        cancel,
      )
      .await
    }
  };

  match result {
    Ok(()) => {
      info!("flow_node_completed");
      Ok(())
    }
    Err(e) => {
      error!(error = %e, "flow_node_failed");
      Err(RuntimeError::node(&node.id, e))
    }
  }
}

pub(crate) fn bindings(bindings: &[Binding]) -> impl Iterator<Item = (String, Value)> + '_ {
  bindings
    .iter()
    .map(|binding| (binding.key.clone(), binding.value.clone()))
}

/// Casts `sys:terminated` when dropped, so a failed or cancelled executor
/// still releases its dependents.
struct Terminated(Arc<dyn EventCaster>);

impl Drop for Terminated {
  fn drop(&mut self) {
    let _ = self.0.cast(Event::Terminated);
  }
}

/// First error of a concurrent cohort; later errors are dropped.
#[derive(Default)]
struct FirstError(Mutex<Option<RuntimeError>>);

impl FirstError {
  /// Returns `true` if `error` was the first one recorded.
  fn record(&self, error: RuntimeError) -> bool {
    match self.0.lock() {
      Ok(mut slot) if slot.is_none() => {
        *slot = Some(error);
        true
      }
      Ok(_) => {
        debug!(error = %error, "cohort_error_discarded");
        false
      }
      Err(_) => false,
    }
  }

  fn take(&self) -> Option<RuntimeError> {
    self.0.lock().ok().and_then(|mut slot| slot.take())
  }
}
