use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

struct Envelope<T> {
  value: T,
  ack: oneshot::Sender<()>,
}

/// Fan-out publisher with per-subscriber acknowledgement.
///
/// Subscriber channels are unbounded, so `broadcast` never blocks on a slow
/// consumer. Completion is tracked through the returned [`Delivery`].
pub struct Broadcaster<T> {
  subscribers: DashMap<u64, mpsc::UnboundedSender<Envelope<T>>>,
  next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
  pub fn new() -> Self {
    Self {
      subscribers: DashMap::new(),
      next_id: AtomicU64::new(0),
    }
  }

  /// Register a new subscriber. Only values broadcast after this call are
  /// delivered to it.
  pub fn subscribe(&self) -> Subscription<T> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = mpsc::unbounded_channel();
    self.subscribers.insert(id, sender);
    Subscription { id, receiver }
  }

  /// Remove a subscriber and close its channel.
  pub fn unsubscribe(&self, subscription: Subscription<T>) {
    self.subscribers.remove(&subscription.id);
  }

  /// Deliver `value` to every current subscriber.
  ///
  /// Subscribers whose receiving side is gone are pruned here.
  pub fn broadcast(&self, value: T) -> Delivery {
    let mut acks = Vec::with_capacity(self.subscribers.len());
    let mut dead = Vec::new();

    for entry in self.subscribers.iter() {
      let (ack, waiter) = oneshot::channel();
      let envelope = Envelope {
        value: value.clone(),
        ack,
      };
      if entry.value().send(envelope).is_ok() {
        acks.push(waiter);
      } else {
        dead.push(*entry.key());
      }
    }

    for id in dead {
      self.subscribers.remove(&id);
    }

    Delivery { acks }
  }

  /// Drop every subscriber. Pending `recv` calls observe the close.
  pub fn close(&self) {
    self.subscribers.clear();
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.len()
  }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Receiving side of a [`Broadcaster`] registration.
pub struct Subscription<T> {
  id: u64,
  receiver: mpsc::UnboundedReceiver<Envelope<T>>,
}

impl<T> Subscription<T> {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Receive the next value, acknowledging it to the broadcaster.
  ///
  /// Returns `None` once the subscription has been closed.
  pub async fn recv(&mut self) -> Option<T> {
    let envelope = self.receiver.recv().await?;
    let _ = envelope.ack.send(());
    Some(envelope.value)
  }
}

/// Completion handle returned by [`Broadcaster::broadcast`].
///
/// A subscriber that is dropped before receiving counts as delivered, so a
/// dead subscriber never holds the handle open.
#[must_use = "a delivery does nothing unless awaited or dropped deliberately"]
pub struct Delivery {
  acks: Vec<oneshot::Receiver<()>>,
}

impl Delivery {
  /// A delivery with no recipients; resolves immediately.
  pub fn empty() -> Self {
    Self { acks: Vec::new() }
  }

  pub fn recipients(&self) -> usize {
    self.acks.len()
  }

  /// Wait until every recipient has received the value.
  pub async fn wait(self) {
    futures::future::join_all(self.acks).await;
  }

  /// Wait for completion or cancellation. Returns `true` when every
  /// recipient received the value.
  pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> bool {
    tokio::select! {
      _ = cancel.cancelled() => false,
      _ = self.wait() => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn test_broadcast_reaches_every_subscriber() {
    let broadcaster = Arc::new(Broadcaster::<u32>::new());
    let mut handles = Vec::new();

    for _ in 0..5 {
      let mut sub = broadcaster.subscribe();
      handles.push(tokio::spawn(async move { sub.recv().await }));
    }

    let delivery = broadcaster.broadcast(7);
    assert_eq!(delivery.recipients(), 5);
    delivery.wait().await;

    for handle in handles {
      assert_eq!(handle.await.unwrap(), Some(7));
    }
  }

  #[tokio::test]
  async fn test_delivery_waits_for_receipt() {
    let broadcaster = Broadcaster::<&'static str>::new();
    let mut sub = broadcaster.subscribe();

    let delivery = broadcaster.broadcast("ready");
    let waiter = tokio::spawn(delivery.wait());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    assert_eq!(sub.recv().await, Some("ready"));
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn test_late_subscriber_misses_earlier_value() {
    let broadcaster = Broadcaster::<u32>::new();
    let mut early = broadcaster.subscribe();
    let _ = broadcaster.broadcast(1);
    let mut late = broadcaster.subscribe();
    let _ = broadcaster.broadcast(2);

    assert_eq!(early.recv().await, Some(1));
    assert_eq!(early.recv().await, Some(2));
    assert_eq!(late.recv().await, Some(2));

    broadcaster.close();
    assert_eq!(late.recv().await, None);
  }

  #[tokio::test]
  async fn test_dropped_subscriber_does_not_block_delivery() {
    let broadcaster = Broadcaster::<u32>::new();
    let sub = broadcaster.subscribe();
    let mut live = broadcaster.subscribe();

    let delivery = broadcaster.broadcast(3);
    drop(sub);
    assert_eq!(live.recv().await, Some(3));

    tokio::time::timeout(Duration::from_secs(1), delivery.wait())
      .await
      .unwrap();

    // The dropped subscriber is pruned on the next broadcast.
    let _ = broadcaster.broadcast(4);
    assert_eq!(broadcaster.subscriber_count(), 1);
  }

  #[tokio::test]
  async fn test_unsubscribe_and_cancelled_wait() {
    let broadcaster = Broadcaster::<u32>::new();
    let sub = broadcaster.subscribe();
    let _idle = broadcaster.subscribe();
    broadcaster.unsubscribe(sub);
    assert_eq!(broadcaster.subscriber_count(), 1);

    let cancel = CancellationToken::new();
    let delivery = broadcaster.broadcast(9);
    cancel.cancel();
    assert!(!delivery.wait_or_cancel(&cancel).await);
    assert!(Delivery::empty().wait_or_cancel(&CancellationToken::new()).await);
  }
}
