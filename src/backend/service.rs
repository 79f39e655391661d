//! C3 Backend Service: owns one backend's [`Transport`], drives the MCP
//! handshake, and caches its tool list. Generalized from the teacher's
//! per-backend struct + `Backend` trait shape to hold a single
//! `Box<dyn Transport>` and to publish lifecycle events the teacher
//! never did.

use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::events::{EventBus, ServiceConnected, ServiceConnectionFailed, ServiceDisconnected};
use crate::transport::{self, Transport, ToolCallResult};
use rmcp::model::Tool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

struct Inner {
    state: ServiceState,
    tools: Vec<Tool>,
    transport: Option<Box<dyn Transport>>,
}

/// One instance per configured backend.
pub struct Service {
    pub name: String,
    pub config: BackendConfig,
    events: Arc<EventBus>,
    inner: RwLock<Inner>,
}

impl Service {
    pub fn new(config: BackendConfig, events: Arc<EventBus>) -> Self {
        Self {
            name: config.name.clone(),
            config,
            events,
            inner: RwLock::new(Inner {
                state: ServiceState::Idle,
                tools: Vec::new(),
                transport: None,
            }),
        }
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.read().await.state
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.inner.read().await.tools.clone()
    }

    /// Connect: spawn/open the transport, complete the MCP handshake
    /// (`tools/list`), and publish `service:connected`. Invariant: the
    /// service's tools never become visible to callers of [`Self::tools`]
    /// until state is `Connected` — the write lock makes this atomic.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.write().await;
            inner.state = ServiceState::Connecting;
        }

        let result = transport::connect_any(&self.config).await;
        let transport = match result {
            Ok(t) => t,
            Err(e) => {
                self.fail(e.to_string(), 1).await;
                return Err(e);
            }
        };

        let tools = match transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = transport.close().await;
                self.fail(e.to_string(), 1).await;
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.write().await;
            inner.transport = Some(transport);
            inner.tools = tools.clone();
            inner.state = ServiceState::Connected;
        }

        info!(service = %self.name, tool_count = tools.len(), "backend connected");
        self.events.publish_service_connected(ServiceConnected {
            name: self.name.clone(),
            tool_count: tools.len(),
        });
        Ok(())
    }

    async fn fail(&self, error: String, attempt: u32) {
        let mut inner = self.inner.write().await;
        inner.state = ServiceState::Failed;
        inner.tools.clear();
        inner.transport = None;
        drop(inner);

        warn!(service = %self.name, %error, attempt, "backend handshake failed");
        self.events
            .publish_service_connection_failed(ServiceConnectionFailed {
                name: self.name.clone(),
                error,
                attempt,
            });
    }

    /// Invoke a tool by local (unprefixed) name.
    pub async fn call_tool(
        &self,
        local_name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<ToolCallResult, TransportError> {
        let inner = self.inner.read().await;
        if inner.state != ServiceState::Connected {
            return Err(TransportError::Closed);
        }
        let transport = inner.transport.as_ref().ok_or(TransportError::Closed)?;
        // Transport implementations multiplex internally, so concurrent
        // calls can share this read guard without serialising on it.
        transport.call_tool(local_name, arguments).await
    }

    /// Disconnect: publish `service:disconnected`, close transport, clear
    /// tool cache, state→Idle.
    pub async fn disconnect(&self, reason: &str) {
        {
            let mut inner = self.inner.write().await;
            inner.state = ServiceState::Disconnecting;
        }

        let transport = {
            let mut inner = self.inner.write().await;
            inner.transport.take()
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                error!(service = %self.name, error = %e, "error closing transport");
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.tools.clear();
            inner.state = ServiceState::Idle;
        }

        info!(service = %self.name, reason, "backend disconnected");
        self.events
            .publish_service_disconnected(ServiceDisconnected {
                name: self.name.clone(),
                reason: reason.to_string(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::adapter::test_support::stdio_config;

    #[tokio::test]
    async fn starts_idle() {
        let events = Arc::new(EventBus::new());
        let service = Service::new(stdio_config("x", "true"), events);
        assert_eq!(service.state().await, ServiceState::Idle);
        assert!(service.tools().await.is_empty());
    }
}
