//! Event system for session notifications
//!
//! Events go out two ways: a broadcast channel for async subscribers and
//! the [`ObserverRegistry`] for synchronous callbacks.

pub mod observer;
pub mod types;

pub use observer::{ObserverId, ObserverRegistry, SessionObserver};
pub use types::SessionEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out point for session events
///
/// ```no_run
/// use pixelstream::events::{EventBus, SessionEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(SessionEvent::Connected);
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.event_name());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    observers: ObserverRegistry,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            observers: ObserverRegistry::new(),
        }
    }

    /// Publish an event to observers and subscribers
    ///
    /// With no subscribers the broadcast send fails, which is fine.
    pub fn publish(&self, event: SessionEvent) {
        self.observers.notify(&event);
        let _ = self.tx.send(event);
    }

    /// Receive all future events
    ///
    /// A subscriber that falls more than the channel capacity behind gets
    /// `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::PlayerCount { count: 2 });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::PlayerCount { count: 2 }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SessionEvent::Error {
            message: "test message".to_string(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), SessionEvent::Error { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SessionEvent::Error { .. }));
    }

    #[test]
    fn test_observers_without_subscribers() {
        struct Counter(AtomicUsize);
        impl SessionObserver for Counter {
            fn on_connected(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.observers().register(counter.clone());
        bus.publish(SessionEvent::Connected);
        bus.publish(SessionEvent::WebRtcConnecting);

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
