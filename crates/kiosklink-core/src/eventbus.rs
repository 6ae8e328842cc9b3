//! Event bus for the KioskLink bridge.
//!
//! All components communicate by publishing and subscribing to
//! [`BridgeEvent`]s. The bus is a broadcast channel: publishing never blocks,
//! and a subscriber that falls behind loses the oldest events rather than
//! stalling the publishers.

use crate::event::{BridgeEvent, EventMetadata};
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast bus distributing bridge events to all subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(BridgeEvent, EventMetadata)>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow
    /// subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `true` if at least one subscriber received
    /// it; with no subscribers the event is discarded.
    pub fn publish(&self, event: BridgeEvent, source: &str) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a bus subscription.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(BridgeEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event, waiting if none is pending.
    ///
    /// Returns `None` once every publisher handle has been dropped. Lagged
    /// events are skipped silently.
    pub async fn recv(&mut self) -> Option<(BridgeEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(pair) => return Some(pair),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event bus subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<(BridgeEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(pair) => return Some(pair),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(BridgeEvent::fleet_health_changed(true), "test"));

        let (event, meta) = rx.recv().await.expect("event");
        assert!(matches!(
            event,
            BridgeEvent::FleetHealthChanged { all_alive: true, .. }
        ));
        assert_eq!(meta.source, "test");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_discarded() {
        let bus = EventBus::new();
        assert!(!bus.publish(BridgeEvent::fleet_health_changed(false), "test"));
    }

    #[tokio::test]
    async fn try_recv_drains_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BridgeEvent::alive_changed("a", true), "test");
        bus.publish(BridgeEvent::alive_changed("b", false), "test");

        let (first, _) = rx.try_recv().expect("first");
        assert_eq!(first.device_key(), Some("a"));
        let (second, _) = rx.try_recv().expect("second");
        assert_eq!(second.device_key(), Some("b"));
        assert!(rx.try_recv().is_none());
    }
}
