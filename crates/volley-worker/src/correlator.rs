//! Routing of master replies back to the request that asked for them.
//!
//! Every resource request a worker sends over its feed gets a fresh request
//! id and a single-use reply slot. The master answers through a separate
//! RPC carrying that id; the correlator finds the slot, hands the reply over
//! and forgets the id. Slots are also dropped when the waiter gives up or the
//! owning connection goes away, so abandoned ids never accumulate.

use std::collections::HashSet;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;
use volley_config::{AuthValue, TargetValue};

use crate::error::WorkerError;

/// A master reply to one resource request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  Loader(String),
  Auth(AuthValue),
  Target(TargetValue),
  StoreData(Vec<((String, String), Value)>),
  StoreOk,
}

impl Reply {
  pub fn kind(&self) -> &'static str {
    match self {
      Reply::Loader(_) => "loader",
      Reply::Auth(_) => "auth",
      Reply::Target(_) => "target",
      Reply::StoreData(_) => "store data",
      Reply::StoreOk => "store ok",
    }
  }
}

struct Pending {
  connection_id: String,
  reply: oneshot::Sender<Reply>,
}

/// Request id to connection and reply slot.
#[derive(Default)]
pub struct RequestCorrelator {
  pending: DashMap<String, Pending>,
  by_connection: DashMap<String, HashSet<String>>,
}

impl RequestCorrelator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Allocate a request id owned by `connection_id`.
  pub fn register(&self, connection_id: &str) -> (String, oneshot::Receiver<Reply>) {
    let request_id = Uuid::new_v4().to_string();
    let (reply, receiver) = oneshot::channel();
    self.pending.insert(
      request_id.clone(),
      Pending {
        connection_id: connection_id.to_string(),
        reply,
      },
    );
    self
      .by_connection
      .entry(connection_id.to_string())
      .or_default()
      .insert(request_id.clone());
    trace!(connection_id, request_id = %request_id, "request_registered");
    (request_id, receiver)
  }

  /// The connection a pending request belongs to.
  pub fn connection_of(&self, request_id: &str) -> Option<String> {
    self
      .pending
      .get(request_id)
      .map(|pending| pending.connection_id.clone())
  }

  /// Deliver `reply` to the waiter of `request_id` and forget the id.
  ///
  /// A waiter that already gave up is not an error; an id that was never
  /// registered (or was already answered) is.
  pub fn complete(&self, request_id: &str, reply: Reply) -> Result<(), WorkerError> {
    let (_, pending) = self
      .pending
      .remove(request_id)
      .ok_or_else(|| WorkerError::UnknownRequest(request_id.to_string()))?;
    self.forget(&pending.connection_id, request_id);
    if pending.reply.send(reply).is_err() {
      trace!(request_id, "reply_waiter_gone");
    }
    Ok(())
  }

  /// Drop one request without answering it.
  pub fn cancel(&self, request_id: &str) {
    if let Some((_, pending)) = self.pending.remove(request_id) {
      self.forget(&pending.connection_id, request_id);
    }
  }

  /// Drop every request of a connection. Their waiters observe a closed
  /// reply slot.
  pub fn drop_connection(&self, connection_id: &str) -> usize {
    let Some((_, ids)) = self.by_connection.remove(connection_id) else {
      return 0;
    };
    for id in &ids {
      self.pending.remove(id);
    }
    ids.len()
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  fn forget(&self, connection_id: &str, request_id: &str) {
    if let Some(mut ids) = self.by_connection.get_mut(connection_id) {
      ids.remove(request_id);
    }
    self
      .by_connection
      .remove_if(connection_id, |_, ids| ids.is_empty());
  }
}
