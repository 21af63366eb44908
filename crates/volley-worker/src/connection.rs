//! Per-connection worker state.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use volley_config::{AuthValue, TargetValue};
use volley_wire::message::{ReceiveChanelConnectResponse, StoreKind};

use crate::error::WorkerError;

type Feed = mpsc::UnboundedReceiver<ReceiveChanelConnectResponse>;

/// Resources fetched from the master, keyed by id.
///
/// Each id gets one cell. Concurrent lookups of a missing id share a single
/// fetch; a failed fetch leaves the cell empty so the next lookup retries.
pub(crate) struct Cached<T> {
  cells: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T> Default for Cached<T> {
  fn default() -> Self {
    Self {
      cells: DashMap::new(),
    }
  }
}

impl<T: Clone> Cached<T> {
  pub(crate) fn get(&self, id: &str) -> Option<T> {
    self.cells.get(id).and_then(|cell| cell.get().cloned())
  }

  pub(crate) async fn get_or_fetch<F, Fut, E>(&self, id: &str, fetch: F) -> Result<T, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let cell = self.cells.entry(id.to_string()).or_default().clone();
    cell.get_or_try_init(fetch).await.cloned()
  }
}

/// Everything a connection has been sent so far.
#[derive(Default)]
pub(crate) struct ResourceCache {
  pub loaders: Cached<String>,
  pub auths: Cached<AuthValue>,
  pub default_auth: OnceCell<AuthValue>,
  pub default_auth_id: RwLock<Option<String>>,
  pub targets: Cached<TargetValue>,
  pub store: DashMap<(String, String), Value>,
}

impl ResourceCache {
  pub(crate) fn set_default_auth_id(&self, auth_id: &str) {
    if let Ok(mut id) = self.default_auth_id.write() {
      *id = Some(auth_id.to_string());
    }
  }

  pub(crate) fn is_default_auth(&self, auth_id: &str) -> bool {
    self
      .default_auth_id
      .read()
      .map(|id| id.as_deref() == Some(auth_id))
      .unwrap_or(false)
  }
}

/// The three context maps a command runs with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultStores {
  pub store: Map<String, Value>,
  pub thread_only: Map<String, Value>,
  pub slave_values: Map<String, Value>,
}

impl DefaultStores {
  pub(crate) fn set(&mut self, kind: StoreKind, map: Map<String, Value>) {
    match kind {
      StoreKind::Store => self.store = map,
      StoreKind::ThreadOnlyStore => self.thread_only = map,
      StoreKind::SlaveValues => self.slave_values = map,
    }
  }
}

/// A command registered by `SlaveCommand`, waiting to be executed.
pub(crate) struct Command {
  pub loader_id: String,
  pub output_root: String,
  stores: Mutex<Option<DefaultStores>>,
  term: Mutex<Option<oneshot::Sender<bool>>>,
  outcome: Mutex<Option<oneshot::Receiver<bool>>>,
}

impl Command {
  fn new(loader_id: String, output_root: String) -> Self {
    let (term, outcome) = oneshot::channel();
    Self {
      loader_id,
      output_root,
      stores: Mutex::new(None),
      term: Mutex::new(Some(term)),
      outcome: Mutex::new(Some(outcome)),
    }
  }

  pub(crate) fn set_stores(&self, stores: DefaultStores) {
    if let Ok(mut slot) = self.stores.lock() {
      *slot = Some(stores);
    }
  }

  pub(crate) fn take_stores(&self) -> Option<DefaultStores> {
    self.stores.lock().ok().and_then(|mut slot| slot.take())
  }

  /// Record the command's outcome. Only the first post is kept.
  pub(crate) fn post(&self, success: bool) -> bool {
    let term = self.term.lock().ok().and_then(|mut term| term.take());
    match term {
      Some(term) => {
        if term.send(success).is_err() {
          debug!("command_outcome_unread");
        }
        true
      }
      None => false,
    }
  }

  pub(crate) fn take_outcome(&self) -> Option<oneshot::Receiver<bool>> {
    self.outcome.lock().ok().and_then(|mut outcome| outcome.take())
  }
}

/// One master connection: its request feed, resource cache and commands.
pub(crate) struct Connection {
  id: String,
  feed: mpsc::UnboundedSender<ReceiveChanelConnectResponse>,
  pending_feed: Mutex<Option<Feed>>,
  cache: ResourceCache,
  commands: DashMap<String, Arc<Command>>,
  cancel: CancellationToken,
}

impl Connection {
  /// Requests sent before the master attaches its feed stay queued.
  pub(crate) fn new(id: String, cancel: CancellationToken) -> Self {
    let (feed, pending_feed) = mpsc::unbounded_channel();
    Self {
      id,
      feed,
      pending_feed: Mutex::new(Some(pending_feed)),
      cache: ResourceCache::default(),
      commands: DashMap::new(),
      cancel,
    }
  }

  pub(crate) fn id(&self) -> &str {
    &self.id
  }

  pub(crate) fn cache(&self) -> &ResourceCache {
    &self.cache
  }

  pub(crate) fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub(crate) fn take_feed(&self) -> Result<Feed, WorkerError> {
    self
      .pending_feed
      .lock()
      .ok()
      .and_then(|mut feed| feed.take())
      .ok_or_else(|| WorkerError::FeedAttached(self.id.clone()))
  }

  /// Queue a request for the master.
  pub(crate) fn send(&self, message: ReceiveChanelConnectResponse) -> Result<(), WorkerError> {
    if self.cancel.is_cancelled() {
      return Err(WorkerError::ConnectionClosed(self.id.clone()));
    }
    self
      .feed
      .send(message)
      .map_err(|_| WorkerError::ConnectionClosed(self.id.clone()))
  }

  pub(crate) fn register_command(&self, loader_id: String, output_root: String) -> String {
    let command_id = uuid::Uuid::new_v4().to_string();
    self
      .commands
      .insert(command_id.clone(), Arc::new(Command::new(loader_id, output_root)));
    command_id
  }

  pub(crate) fn command(&self, command_id: &str) -> Result<Arc<Command>, WorkerError> {
    self
      .commands
      .get(command_id)
      .map(|command| command.clone())
      .ok_or_else(|| WorkerError::UnknownCommand {
        connection_id: self.id.clone(),
        command_id: command_id.to_string(),
      })
  }

  pub(crate) fn remove_command(&self, command_id: &str) {
    self.commands.remove(command_id);
  }

  pub(crate) fn close(&self) {
    self.cancel.cancel();
    let dropped = self.commands.len();
    self.commands.clear();
    if dropped > 0 {
      warn!(connection_id = %self.id, commands = dropped, "connection_closed_with_commands");
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[tokio::test]
  async fn test_concurrent_misses_share_one_fetch() {
    let cache: Arc<Cached<String>> = Arc::new(Cached::default());
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
      let cache = cache.clone();
      let fetches = fetches.clone();
      tasks.push(tokio::spawn(async move {
        cache
          .get_or_fetch("a.yaml", || async {
            fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok::<_, WorkerError>("kind: MemoryValue".to_string())
          })
          .await
          .unwrap()
      }));
    }
    for task in tasks {
      assert_eq!(task.await.unwrap(), "kind: MemoryValue");
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("a.yaml").as_deref(), Some("kind: MemoryValue"));
  }

  #[tokio::test]
  async fn test_failed_fetch_is_retried() {
    let cache: Cached<String> = Cached::default();
    let failed = cache
      .get_or_fetch("t", || async {
        Err::<String, _>(WorkerError::ConnectionClosed("c".to_string()))
      })
      .await;
    assert!(failed.is_err());
    assert!(cache.get("t").is_none());

    let value = cache
      .get_or_fetch("t", || async { Ok::<_, WorkerError>("x".to_string()) })
      .await
      .unwrap();
    assert_eq!(value, "x");
  }

  #[tokio::test]
  async fn test_outcome_posted_once() {
    let connection = Connection::new("c1".to_string(), CancellationToken::new());
    let id = connection.register_command("a.yaml".to_string(), "out".to_string());
    let command = connection.command(&id).unwrap();

    let outcome = command.take_outcome().unwrap();
    assert!(command.take_outcome().is_none());
    assert!(command.post(true));
    assert!(!command.post(false));
    assert!(outcome.await.unwrap());

    connection.remove_command(&id);
    assert!(matches!(
      connection.command(&id),
      Err(WorkerError::UnknownCommand { .. })
    ));
  }

  #[tokio::test]
  async fn test_feed_is_taken_once_and_closes_with_connection() {
    let connection = Connection::new("c1".to_string(), CancellationToken::new());
    let mut feed = connection.take_feed().unwrap();
    assert!(matches!(
      connection.take_feed(),
      Err(WorkerError::FeedAttached(_))
    ));

    connection
      .send(ReceiveChanelConnectResponse {
        request_id: "r1".to_string(),
        request: volley_wire::message::WorkerRequest::Target {
          target_id: "api".to_string(),
        },
      })
      .unwrap();
    assert_eq!(feed.recv().await.unwrap().request_id, "r1");

    connection.close();
    assert!(matches!(
      connection.send(ReceiveChanelConnectResponse {
        request_id: "r2".to_string(),
        request: volley_wire::message::WorkerRequest::Loader {
          loader_id: "a".to_string(),
        },
      }),
      Err(WorkerError::ConnectionClosed(_))
    ));
  }
}
