//! Synchronous observers
//!
//! Hosts that prefer callbacks over a broadcast receiver register a
//! [`SessionObserver`]. Every method has an empty default, so an observer
//! only implements what it cares about.

use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

use super::types::SessionEvent;
use crate::stats::{LatencyBreakdown, StatsView};

pub trait SessionObserver: Send + Sync {
    /// Called for every event, before the specific method
    fn on_event(&self, _event: &SessionEvent) {}

    fn on_state_changed(&self, _state: &str) {}

    fn on_streamer_list(&self, _streamers: &[String], _auto_selected: Option<&str>) {}

    fn on_connected(&self) {}

    fn on_disconnected(&self, _reason: &str, _allow_manual_reconnect: bool) {}

    fn on_stats(&self, _stats: &StatsView) {}

    fn on_latency(&self, _latency: &LatencyBreakdown) {}

    fn on_streamer_message(&self, _name: &str, _payload: &str) {}
}

/// Registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<(ObserverId, Arc<dyn SessionObserver>)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        let id = ObserverId(Uuid::new_v4());
        self.observers.write().push((id, observer));
        id
    }

    /// Returns false if `id` was not registered
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Dispatch an event to every observer
    pub fn notify(&self, event: &SessionEvent) {
        // Snapshot so observers may (un)register from inside a callback
        let observers: Vec<_> = self.observers.read().iter().map(|(_, o)| o.clone()).collect();

        for observer in observers {
            observer.on_event(event);
            match event {
                SessionEvent::StateChanged { state } => observer.on_state_changed(state),
                SessionEvent::StreamerList {
                    streamers,
                    auto_selected,
                    ..
                } => observer.on_streamer_list(streamers, auto_selected.as_deref()),
                SessionEvent::Connected => observer.on_connected(),
                SessionEvent::Disconnected {
                    reason,
                    allow_manual_reconnect,
                } => observer.on_disconnected(reason, *allow_manual_reconnect),
                SessionEvent::StatsTick { stats } => observer.on_stats(stats),
                SessionEvent::LatencyCalculated { latency } => observer.on_latency(latency),
                SessionEvent::StreamerMessage { name, payload } => {
                    observer.on_streamer_message(name, payload)
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        disconnects: Mutex<Vec<(String, bool)>>,
    }

    impl SessionObserver for Recorder {
        fn on_event(&self, event: &SessionEvent) {
            self.events.lock().push(event.event_name());
        }

        fn on_disconnected(&self, reason: &str, allow_manual_reconnect: bool) {
            self.disconnects
                .lock()
                .push((reason.to_string(), allow_manual_reconnect));
        }
    }

    #[test]
    fn test_notify_dispatches_specific_methods() {
        let registry = ObserverRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.register(recorder.clone());

        registry.notify(&SessionEvent::Connected);
        registry.notify(&SessionEvent::Disconnected {
            reason: "closed".to_string(),
            allow_manual_reconnect: false,
        });

        assert_eq!(
            *recorder.events.lock(),
            vec!["webrtc.connected", "session.disconnected"]
        );
        assert_eq!(
            *recorder.disconnects.lock(),
            vec![("closed".to_string(), false)]
        );
    }

    #[test]
    fn test_unregister() {
        let registry = ObserverRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let id = registry.register(recorder.clone());
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());

        registry.notify(&SessionEvent::Connected);
        assert!(recorder.events.lock().is_empty());
    }
}
