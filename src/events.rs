//! C11 Event Bus: in-process topic pub/sub for decoupled cache refresh
//! and status broadcast. Grounded on `tokio::sync::broadcast` — the
//! teacher only needed single-shot shutdown signalling (`Notify`), but
//! broadcast is the idiomatic multi-topic multi-subscriber choice the
//! rest of the ecosystem reaches for.
//!
//! Per-topic ordering is guaranteed by `broadcast`'s single-channel-
//! per-topic design: publications to one topic are delivered to every
//! subscriber in publication order.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConnected {
    pub name: String,
    pub tool_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDisconnected {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConnectionFailed {
    pub name: String,
    pub error: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatusChanged {
    pub endpoint: String,
    pub healthy: bool,
}

/// The four topics the core publishes; each gets its own broadcast
/// channel so a slow/absent subscriber on one topic can't back-pressure
/// another.
pub struct EventBus {
    service_connected: broadcast::Sender<ServiceConnected>,
    service_disconnected: broadcast::Sender<ServiceDisconnected>,
    service_connection_failed: broadcast::Sender<ServiceConnectionFailed>,
    endpoint_status_changed: broadcast::Sender<EndpointStatusChanged>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            service_connected: broadcast::channel(CHANNEL_CAPACITY).0,
            service_disconnected: broadcast::channel(CHANNEL_CAPACITY).0,
            service_connection_failed: broadcast::channel(CHANNEL_CAPACITY).0,
            endpoint_status_changed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish_service_connected(&self, event: ServiceConnected) {
        let _ = self.service_connected.send(event);
    }

    pub fn subscribe_service_connected(&self) -> broadcast::Receiver<ServiceConnected> {
        self.service_connected.subscribe()
    }

    pub fn publish_service_disconnected(&self, event: ServiceDisconnected) {
        let _ = self.service_disconnected.send(event);
    }

    pub fn subscribe_service_disconnected(&self) -> broadcast::Receiver<ServiceDisconnected> {
        self.service_disconnected.subscribe()
    }

    pub fn publish_service_connection_failed(&self, event: ServiceConnectionFailed) {
        let _ = self.service_connection_failed.send(event);
    }

    pub fn subscribe_service_connection_failed(
        &self,
    ) -> broadcast::Receiver<ServiceConnectionFailed> {
        self.service_connection_failed.subscribe()
    }

    pub fn publish_endpoint_status_changed(&self, event: EndpointStatusChanged) {
        let _ = self.endpoint_status_changed.send(event);
    }

    pub fn subscribe_endpoint_status_changed(&self) -> broadcast::Receiver<EndpointStatusChanged> {
        self.endpoint_status_changed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_service_connected();

        bus.publish_service_connected(ServiceConnected {
            name: "a".into(),
            tool_count: 1,
        });
        bus.publish_service_connected(ServiceConnected {
            name: "b".into(),
            tool_count: 2,
        });

        assert_eq!(rx.recv().await.unwrap().name, "a");
        assert_eq!(rx.recv().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_service_disconnected(ServiceDisconnected {
            name: "x".into(),
            reason: "test".into(),
        });
    }
}
