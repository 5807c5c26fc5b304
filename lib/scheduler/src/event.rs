//! Event bus contract and an in-process implementation.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Named event channels that event triggers subscribe to.
pub trait EventBus: Send + Sync {
    /// Subscribes to an event. Every event published afterwards is
    /// delivered with its payload.
    fn subscribe(&self, event: &str) -> broadcast::Receiver<JsonValue>;
}

/// Event bus backed by one broadcast channel per event name.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<JsonValue>>>,
}

impl InMemoryEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event. Returns the number of subscribers it reached.
    pub fn publish(&self, event: &str, payload: JsonValue) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = channels
            .get(event)
            .and_then(|tx| tx.send(payload).ok())
            .unwrap_or(0);
        debug!(event, delivered, "event published");
        delivered
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, event: &str) -> broadcast::Receiver<JsonValue> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_payloads_for_their_event() {
        let bus = InMemoryEventBus::new();
        let mut orders = bus.subscribe("order.created");
        let mut other = bus.subscribe("order.cancelled");

        assert_eq!(bus.publish("order.created", json!({ "id": 7 })), 1);
        assert_eq!(orders.recv().await.unwrap(), json!({ "id": 7 }));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_reaches_nobody() {
        let bus = InMemoryEventBus::new();
        assert_eq!(bus.publish("nothing", json!(null)), 0);
    }
}
