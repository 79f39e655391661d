//! StreamableHTTP backend transport. Absorbs the teacher's lenient-client
//! wrapper: some backends respond with a bare JSON body instead of a
//! proper SSE/chunked stream, so we always build the client ourselves
//! (rather than `from_uri`) to control headers and leave room for future
//! response-shape tolerance.

use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::transport::{http_client_with_headers, map_call_tool_result, with_timeout, Transport, ToolCallResult};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Tool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct StreamableHttpTransport {
    service: RwLock<Option<RunningService<RoleClient, ()>>>,
    timeout: Duration,
}

impl StreamableHttpTransport {
    pub async fn connect(config: &BackendConfig) -> Result<Self, TransportError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| TransportError::ConnectFailed("http backend missing url".into()))?;

        let http_client = http_client_with_headers(&config.headers)?;
        let transport_config = StreamableHttpClientTransportConfig {
            uri: url.to_string().into(),
            ..Default::default()
        };

        let transport = StreamableHttpClientTransport::with_client(http_client, transport_config);

        let service = ().serve(transport).await.map_err(|e| {
            TransportError::ConnectFailed(format!("handshake failed: {e}"))
        })?;

        Ok(Self {
            service: RwLock::new(Some(service)),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        with_timeout(self.timeout, async {
            let guard = self.service.read().await;
            let service = guard.as_ref().ok_or(TransportError::Closed)?;
            Ok(service
                .peer()
                .list_tools(Default::default())
                .await
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
                .tools)
        })
        .await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<ToolCallResult, TransportError> {
        with_timeout(self.timeout, async {
            let guard = self.service.read().await;
            let service = guard.as_ref().ok_or(TransportError::Closed)?;
            let arguments = arguments.and_then(|v| v.as_object().cloned());
            let result = service
                .peer()
                .call_tool(CallToolRequestParam {
                    name: name.to_string().into(),
                    arguments,
                })
                .await
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
            Ok(map_call_tool_result(result))
        })
        .await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        with_timeout(self.timeout, async {
            let guard = self.service.read().await;
            let service = guard.as_ref().ok_or(TransportError::Closed)?;
            service
                .peer()
                .list_tools(Default::default())
                .await
                .map(|_| ())
                .map_err(|e| TransportError::ProtocolError(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(service) = self.service.write().await.take() {
            let _ = service.cancel().await;
        }
        Ok(())
    }
}
