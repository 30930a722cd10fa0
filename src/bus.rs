//! Process-wide event bus coupling the Service Manager and Endpoint Manager.
//!
//! Delivery is fan-out to every current subscriber via [`tokio::sync::broadcast`].
//! A lagging subscriber drops the oldest events rather than blocking publishers;
//! callers that need every event should drain their receiver promptly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::NamespacedTool;

const BUS_CAPACITY: usize = 256;

/// The operation an `endpoint.status` event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointOperation {
    Connect,
    Disconnect,
    Reconnect,
    Add,
    Remove,
}

/// A topic carried on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum Event {
    #[serde(rename = "server.added")]
    ServerAdded {
        name: String,
        tools: Arc<Vec<NamespacedTool>>,
    },
    #[serde(rename = "server.batchAdded")]
    ServerBatchAdded {
        added_count: usize,
        failed_count: usize,
        names: Vec<String>,
    },
    #[serde(rename = "server.failed")]
    ServerFailed { name: String, error: String },
    #[serde(rename = "endpoint.status")]
    EndpointStatus {
        url: String,
        connected: bool,
        operation: EndpointOperation,
        success: bool,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "endpoint.reconnect.completed")]
    EndpointReconnectCompleted {
        trigger: String,
        endpoint_count: usize,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "endpoint.reconnect.failed")]
    EndpointReconnectFailed {
        trigger: String,
        endpoint_count: usize,
        timestamp: DateTime<Utc>,
        error: String,
    },
}

/// Process-wide in-memory publish/subscribe bus.
///
/// Cloning an `EventBus` shares the same underlying channel; there is
/// deliberately no global singleton accessor. Callers construct one and
/// pass it to every component that needs to publish or subscribe.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Returns the number of active subscribers that
    /// received it; a send with zero subscribers is not an error.
    pub fn publish(&self, event: Event) {
        // A `SendError` here only means nobody is currently listening.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Drops this bus's retained state. Existing receivers continue to
    /// drain whatever is already queued but further publishes are inert
    /// once every sender handle (including this one) is dropped.
    pub fn destroy(self) {
        drop(self);
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

    #[tokio::test]
    async fn subscriber_receives_published_event_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::ServerFailed {
            name: "calc".into(),
            error: "boom".into(),
        });
        bus.publish(Event::ServerBatchAdded {
            added_count: 1,
            failed_count: 0,
            names: vec!["time".into()],
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::ServerFailed { name, .. } if name == "calc"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::ServerBatchAdded { added_count: 1, .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::ServerFailed {
            name: "calc".into(),
            error: "boom".into(),
        });
    }
}
