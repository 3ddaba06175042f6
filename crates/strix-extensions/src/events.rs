//! Broadcast-based notifications for UI and host collaborators.
//!
//! The runtime publishes events here so badge surfaces, debugging panels,
//! and the shell can observe extension activity without reaching into
//! runtime internals. Slow subscribers miss events (lagged) rather than
//! blocking the publisher.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events emitted by the extension runtime
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// The set of registered extensions changed
    ExtensionListChanged {
        /// Number of registered extensions after the change
        count: usize,
    },
    /// A background page reached the running state
    BackgroundPageStarted {
        /// Owning extension
        extension_id: String,
    },
    /// A background page finished tearing down
    BackgroundPageStopped {
        /// Owning extension
        extension_id: String,
    },
    /// An alarm fired and was delivered to its background page
    AlarmFired {
        /// Owning extension
        extension_id: String,
        /// Alarm name
        name: String,
    },
    /// A request was blocked by an extension rule
    RequestBlocked {
        /// Extension whose rule matched
        extension_id: String,
        /// Request URL
        url: String,
    },
    /// A request was redirected by an extension rule
    RequestRedirected {
        /// Extension whose rule matched
        extension_id: String,
        /// Request URL
        url: String,
        /// Redirect target
        target: String,
    },
    /// Request headers were modified by one or more extensions
    RequestModified {
        /// Extensions that contributed header modifications, in load order
        extension_ids: Vec<String>,
        /// Request URL
        url: String,
    },
}

impl RuntimeEvent {
    /// The extension an event belongs to, when there is exactly one
    #[must_use]
    pub fn extension_id(&self) -> Option<&str> {
        match self {
            Self::BackgroundPageStarted { extension_id }
            | Self::BackgroundPageStopped { extension_id }
            | Self::AlarmFired { extension_id, .. }
            | Self::RequestBlocked { extension_id, .. }
            | Self::RequestRedirected { extension_id, .. } => Some(extension_id),
            Self::ExtensionListChanged { .. } | Self::RequestModified { .. } => None,
        }
    }
}

/// Broadcast-based event bus for runtime notifications
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    ///
    /// Subscribers lagging by more than `capacity` events receive
    /// `RecvError::Lagged` on the next recv instead of stalling publishers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of subscribers that received it.
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Current number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(RuntimeEvent::AlarmFired {
            extension_id: "adblock".to_string(),
            name: "refresh-filters".to_string(),
        });

        let event = bus_event(&mut rx).await;
        assert_eq!(event.extension_id(), Some("adblock"));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let count = bus.publish(RuntimeEvent::ExtensionListChanged { count: 3 });
        assert_eq!(count, 2);

        assert!(bus_event(&mut rx1).await.extension_id().is_none());
        assert!(bus_event(&mut rx2).await.extension_id().is_none());
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        let delivered = bus.publish(RuntimeEvent::BackgroundPageStopped {
            extension_id: "x".to_string(),
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RuntimeEvent::RequestBlocked {
            extension_id: "adblock".to_string(),
            url: "https://ads.example.com/banner".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"request_blocked\""));
        assert!(json.contains("ads.example.com"));
    }

    async fn bus_event(rx: &mut broadcast::Receiver<RuntimeEvent>) -> RuntimeEvent {
        rx.recv().await.unwrap()
    }
}
