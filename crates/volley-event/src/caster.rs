use std::sync::Arc;

use tracing::trace;

use crate::broadcaster::{Broadcaster, Delivery};
use crate::event::Event;

/// Sink for the events a running flow node produces.
///
/// `cast` never blocks; callers that need delivery guarantees await the
/// returned [`Delivery`].
pub trait EventCaster: Send + Sync {
  fn cast(&self, event: Event) -> Delivery;
}

/// Discards every event. Used for work executed on a worker, where no
/// dependents are listening.
#[derive(Debug, Clone, Default)]
pub struct NoopCaster;

impl EventCaster for NoopCaster {
  fn cast(&self, _event: Event) -> Delivery {
    Delivery::empty()
  }
}

/// Forwards events to a node's broadcaster.
#[derive(Clone)]
pub struct BroadcastCaster {
  node_id: String,
  broadcaster: Arc<Broadcaster<Event>>,
}

impl BroadcastCaster {
  pub fn new(node_id: impl Into<String>, broadcaster: Arc<Broadcaster<Event>>) -> Self {
    Self {
      node_id: node_id.into(),
      broadcaster,
    }
  }
}

impl EventCaster for BroadcastCaster {
  fn cast(&self, event: Event) -> Delivery {
    trace!(node_id = %self.node_id, event = %event, "event_cast");
    self.broadcaster.broadcast(event)
  }
}
