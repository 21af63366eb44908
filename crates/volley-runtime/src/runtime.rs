//! The runtime handle shared by every executor of a run.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Map;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use volley_config::SlaveDef;
use volley_event::EventCaster;
use volley_flow::Flow;
use volley_host::Collaborators;
use volley_master::{MasterError, SessionManager, WorkerRequestHandler};

use crate::error::RuntimeError;
use crate::orchestrator;
use crate::values::ValueStore;

/// Runs flows and runner files against a set of collaborators.
///
/// Cloning is cheap; clones share the collaborators, the session table and
/// the background worker-request handlers.
#[derive(Clone)]
pub struct Runtime {
  collaborators: Collaborators,
  workers: Option<Arc<Workers>>,
}

/// Live worker sessions plus the handlers serving their request feeds.
struct Workers {
  sessions: Arc<SessionManager>,
  handlers: Mutex<JoinSet<Result<(), MasterError>>>,
}

impl Runtime {
  pub fn new(collaborators: Collaborators) -> Self {
    Self {
      collaborators,
      workers: None,
    }
  }

  /// Enable `SlaveConnect` runners and `slaveCmd` nodes.
  pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
    self.workers = Some(Arc::new(Workers {
      sessions,
      handlers: Mutex::new(JoinSet::new()),
    }));
    self
  }

  pub fn collaborators(&self) -> &Collaborators {
    &self.collaborators
  }

  pub fn sessions(&self) -> Option<&Arc<SessionManager>> {
    self.workers.as_ref().map(|workers| &workers.sessions)
  }

  /// Run a flow from the top: no slave values, call count 0.
  pub async fn run_flow(
    &self,
    flow: &Flow,
    values: Arc<ValueStore>,
    output_root: &Path,
    cancel: CancellationToken,
  ) -> Result<(), RuntimeError> {
    orchestrator::run(
      self.clone(),
      flow,
      values,
      output_root,
      0,
      Arc::new(Map::new()),
      cancel,
    )
    .await
  }

  /// Connect `slaves` and start serving their request feeds in the
  /// background until each session ends or `cancel` fires.
  pub(crate) async fn connect_workers(
    &self,
    slaves: &[SlaveDef],
    caster: &dyn EventCaster,
    cancel: &CancellationToken,
  ) -> Result<(), RuntimeError> {
    let workers = self
      .workers
      .as_ref()
      .ok_or(RuntimeError::SessionsUnavailable)?;

    let sessions = workers.sessions.connect_all(slaves, caster).await?;
    let handler = WorkerRequestHandler::new(
      self.collaborators.templates.clone(),
      self.collaborators.auth.clone(),
      self.collaborators.target.clone(),
      self.collaborators.store.clone(),
    );

    let mut handlers = workers
      .handlers
      .lock()
      .map_err(|_| RuntimeError::Join("worker handler table poisoned".to_string()))?;
    for session in sessions {
      let handler = handler.clone();
      let cancel = cancel.clone();
      handlers.spawn(async move {
        let worker_id = session.worker_id().to_string();
        let result = handler.run(session, cancel).await;
        if let Err(e) = &result {
          error!(worker_id = %worker_id, error = %e, "worker_request_handler_failed");
        }
        result
      });
    }
    Ok(())
  }

  /// Disconnect every worker and wait for the request handlers to finish.
  ///
  /// Returns the first disconnect or handler error.
  #[instrument(name = "runtime_shutdown", skip(self))]
  pub async fn shutdown(&self) -> Result<(), RuntimeError> {
    let Some(workers) = &self.workers else {
      return Ok(());
    };

    let mut first_error = workers
      .sessions
      .disconnect_all()
      .await
      .err()
      .map(RuntimeError::from);

    let mut handlers = match workers.handlers.lock() {
      Ok(mut handlers) => std::mem::take(&mut *handlers),
      Err(_) => JoinSet::new(),
    };
    while let Some(joined) = handlers.join_next().await {
      let error = match joined {
        Ok(Ok(())) => continue,
        Ok(Err(e)) => RuntimeError::from(e),
        Err(e) => RuntimeError::Join(e.to_string()),
      };
      warn!(error = %error, "worker_handler_error");
      first_error.get_or_insert(error);
    }

    info!("runtime_stopped");
    first_error.map_or(Ok(()), Err)
  }
}
