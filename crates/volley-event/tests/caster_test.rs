use std::sync::Arc;
use std::time::Duration;

use volley_event::{BroadcastCaster, Broadcaster, Event, EventCaster, NoopCaster};

#[tokio::test]
async fn test_broadcast_caster_delivers_to_dependents() {
  let broadcaster = Arc::new(Broadcaster::new());
  let mut dependent = broadcaster.subscribe();
  let caster = BroadcastCaster::new("a", broadcaster.clone());

  let delivery = caster.cast(Event::Start);
  let _ = caster.cast(Event::Terminated);

  assert_eq!(dependent.recv().await, Some(Event::Start));
  tokio::time::timeout(Duration::from_secs(1), delivery.wait())
    .await
    .unwrap();
  assert_eq!(dependent.recv().await, Some(Event::Terminated));
}

#[tokio::test]
async fn test_noop_caster_resolves_immediately() {
  let delivery = NoopCaster.cast(Event::Validated);
  assert_eq!(delivery.recipients(), 0);
  delivery.wait().await;
}
