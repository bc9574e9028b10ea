//! Event system for real-time state notifications
//!
//! This module provides the status broadcaster: camera state, viewer count
//! and session changes are published here and fanned out to WebSocket
//! clients and other subscribers.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Default per-subscriber queue length
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event bus for broadcasting system events
///
/// Backed by a tokio broadcast channel, so every subscriber has its own
/// bounded view of a shared ring buffer. Publishing never waits for
/// subscribers: a subscriber that falls more than `capacity` events behind
/// loses the oldest ones and receives `RecvError::Lagged(n)` once.
///
/// # Example
///
/// ```no_run
/// use sentinel_live::events::{EventBus, SystemEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SystemEvent::ViewerCountChanged {
///     camera_id: "cam1".to_string(),
///     viewers: 1,
/// });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("Received event: {:?}", event);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a new event bus with a specific per-subscriber capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: SystemEvent) {
        tracing::trace!(event = event.event_name(), "Publishing event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// Returns a receiver that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Per-subscriber queue length
    pub fn capacity(&self) -> usize {
        self.capacity
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
    use tokio::sync::broadcast::error::RecvError;

    fn viewers(n: usize) -> SystemEvent {
        SystemEvent::ViewerCountChanged {
            camera_id: "cam1".to_string(),
            viewers: n,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(viewers(1));

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            SystemEvent::ViewerCountChanged { viewers: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::Error {
            message: "test message".to_string(),
        });

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();

        assert!(matches!(event1, SystemEvent::Error { .. }));
        assert!(matches!(event2, SystemEvent::Error { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic when publishing with no subscribers
        bus.publish(viewers(0));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::with_capacity(4);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for n in 0..10 {
            bus.publish(viewers(n));
            // Fast subscriber keeps up
            assert!(matches!(
                fast.recv().await.unwrap(),
                SystemEvent::ViewerCountChanged { viewers, .. } if viewers == n
            ));
        }

        // Slow subscriber lost the 6 oldest events and resumes with the newest 4
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(6))));
        assert!(matches!(
            slow.recv().await.unwrap(),
            SystemEvent::ViewerCountChanged { viewers: 6, .. }
        ));
    }
}
