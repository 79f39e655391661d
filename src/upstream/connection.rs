//! C9 Upstream Connection: one long-lived WebSocket to one xiaozhi
//! endpoint. Peer sends JSON-RPC requests; we answer via the MCP Message
//! Handler (C8). **Supplement**: the teacher has no outbound WebSocket
//! client at all (its admin surface is inbound-only axum), so this is
//! new code grounded on `tokio-tungstenite`'s confirmed use in the
//! pack's `whtiehack-zeroclaw` repo.

use crate::events::{EndpointStatusChanged, EventBus};
use crate::mcp::handler::{JsonRpcRequest, McpHandler};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Unhealthy,
    Disconnected,
    Failed,
}

/// One upstream endpoint's connection state, owned by the Manager (C10).
pub struct UpstreamConnection {
    pub endpoint: String,
    state: RwLock<ConnectionState>,
    last_healthy_at: AtomicI64,
    reconnect_attempt: AtomicU32,
    consecutive_ping_failures: AtomicU32,
    inflight: AtomicU32,
    outgoing: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    events: Arc<EventBus>,
    /// Notified from the read loop whenever a `Pong` frame arrives, so
    /// `send_ping` can wait for the round trip instead of trusting that
    /// the local outgoing channel is merely still open.
    pong: Notify,
}

impl UpstreamConnection {
    pub fn new(endpoint: String, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            state: RwLock::new(ConnectionState::Idle),
            last_healthy_at: AtomicI64::new(0),
            reconnect_attempt: AtomicU32::new(0),
            consecutive_ping_failures: AtomicU32::new(0),
            inflight: AtomicU32::new(0),
            outgoing: RwLock::new(None),
            events,
            pong: Notify::new(),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn inflight_count(&self) -> u32 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::Relaxed)
    }

    pub fn last_healthy_at(&self) -> i64 {
        self.last_healthy_at.load(Ordering::Relaxed)
    }

    async fn set_state(&self, state: ConnectionState) {
        let previous = {
            let mut guard = self.state.write().await;
            let previous = *guard;
            *guard = state;
            previous
        };
        if previous != state {
            self.events.publish_endpoint_status_changed(EndpointStatusChanged {
                endpoint: self.endpoint.clone(),
                healthy: matches!(state, ConnectionState::Connected),
            });
        }
    }

    /// Connect, spawning the read loop (feeding `handler`) and the write
    /// loop (draining an internal channel of outgoing frames). Returns
    /// once the socket is open; the loops run until the socket closes.
    pub async fn connect(self: &Arc<Self>, handler: Arc<McpHandler>) -> Result<(), crate::error::UpstreamError> {
        self.set_state(ConnectionState::Connecting).await;

        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| crate::error::UpstreamError::InvalidEndpoint(e.to_string()))?;

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| crate::error::UpstreamError::ConnectFailed(e.to_string()))?;

        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.write().await = Some(tx);

        self.consecutive_ping_failures.store(0, Ordering::Relaxed);
        self.reconnect_attempt.store(0, Ordering::Relaxed);
        self.last_healthy_at.store(crate::audit::now_millis(), Ordering::Relaxed);
        self.set_state(ConnectionState::Connected).await;
        info!(endpoint = %self.endpoint, "upstream connected");

        let write_endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!(endpoint = %write_endpoint, error = %e, "upstream write failed");
                    break;
                }
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => this.handle_incoming(&handler, &text.to_string()).await,
                    Ok(Message::Ping(payload)) => this.send_raw(Message::Pong(payload)).await,
                    Ok(Message::Pong(_)) => this.pong.notify_one(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(endpoint = %this.endpoint, error = %e, "upstream read error");
                        break;
                    }
                }
            }
            this.on_closed().await;
        });

        Ok(())
    }

    async fn handle_incoming(self: &Arc<Self>, handler: &Arc<McpHandler>, text: &str) {
        let request: JsonRpcRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "dropping malformed upstream frame");
                return;
            }
        };

        self.inflight.fetch_add(1, Ordering::Relaxed);
        let response = handler.handle(request).await;
        self.inflight.fetch_sub(1, Ordering::Relaxed);

        if let Some(response) = response
            && let Ok(payload) = serde_json::to_string(&response)
        {
            self.send_raw(Message::Text(payload.into())).await;
        }
    }

    async fn send_raw(&self, message: Message) {
        if let Some(sender) = self.outgoing.read().await.as_ref() {
            let _ = sender.send(message);
        }
    }

    /// Send a `ping` frame and wait up to `timeout` for the matching
    /// `Pong`, read by the socket's read loop. A peer that stops
    /// responding but leaves the TCP connection half-open fails this
    /// check even though the local outgoing channel is still open.
    pub async fn send_ping(&self, timeout: Duration) -> bool {
        if self.outgoing.read().await.is_none() {
            return false;
        }
        self.send_raw(Message::Ping(Vec::new().into())).await;
        tokio::time::timeout(timeout, self.pong.notified()).await.is_ok()
    }

    pub fn record_ping_result(&self, succeeded: bool) -> u32 {
        if succeeded {
            self.consecutive_ping_failures.store(0, Ordering::Relaxed);
            self.last_healthy_at.store(crate::audit::now_millis(), Ordering::Relaxed);
            0
        } else {
            self.consecutive_ping_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub async fn mark_unhealthy(&self) {
        self.set_state(ConnectionState::Unhealthy).await;
    }

    async fn on_closed(self: &Arc<Self>) {
        *self.outgoing.write().await = None;
        self.set_state(ConnectionState::Disconnected).await;
        warn!(endpoint = %self.endpoint, "upstream connection closed");
    }

    /// Close cooperatively within the caller's grace window.
    pub async fn close(&self) {
        self.send_raw(Message::Close(None)).await;
        *self.outgoing.write().await = None;
        self.set_state(ConnectionState::Disconnected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::backend::registry::ServiceRegistry;
    use crate::router::custom::{CustomToolHandler, DispatchToRouter};
    use crate::router::ToolRegistry;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    struct NoopDispatcher;

    #[async_trait]
    impl DispatchToRouter for NoopDispatcher {
        async fn call_tool(
            &self,
            prefixed_name: &str,
            _arguments: Option<serde_json::Value>,
        ) -> Result<crate::transport::ToolCallResult, crate::error::RouterError> {
            Err(crate::error::RouterError::ToolNotFound(prefixed_name.to_string()))
        }
    }

    async fn test_handler() -> Arc<McpHandler> {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path().join("calls.jsonl"), 10).await.unwrap());
        let custom = Arc::new(CustomToolHandler::new(Arc::new(NoopDispatcher)));
        let router = Arc::new(ToolRegistry::new(Arc::new(ServiceRegistry::new()), custom, audit));
        Arc::new(McpHandler::new(router, "test".into(), "0".into()))
    }

    #[tokio::test]
    async fn send_ping_false_without_a_connection() {
        let events = Arc::new(EventBus::new());
        let connection = UpstreamConnection::new("ws://127.0.0.1:0".into(), events);
        assert!(!connection.send_ping(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn send_ping_true_when_peer_answers_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            while let Some(Ok(Message::Ping(payload))) = read.next().await {
                let _ = write.send(Message::Pong(payload)).await;
            }
        });

        let events = Arc::new(EventBus::new());
        let connection = UpstreamConnection::new(format!("ws://{addr}/"), events);
        connection.connect(test_handler().await).await.unwrap();

        assert!(connection.send_ping(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn send_ping_false_when_peer_never_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Accept the socket but never answer pings.
            let (_write, mut read) = ws.split();
            while read.next().await.is_some() {}
        });

        let events = Arc::new(EventBus::new());
        let connection = UpstreamConnection::new(format!("ws://{addr}/"), events);
        connection.connect(test_handler().await).await.unwrap();

        assert!(!connection.send_ping(Duration::from_millis(200)).await);
        assert_eq!(connection.record_ping_result(false), 1);
    }
}
