//! C2 Backend Transport: the uniform surface [`Service`](crate::backend::service)
//! drives regardless of whether the backend is a child process (Stdio), an
//! SSE stream, or StreamableHTTP. Each concrete transport wraps an rmcp
//! client connection; this module hosts the trait and the result-shape
//! helpers shared across all three.

pub mod http;
pub mod sse;
pub mod stdio;

use crate::config::BackendConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use rmcp::model::{CallToolResult, Tool};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// A live connection to a single backend MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// List the tools the backend currently advertises.
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError>;

    /// Invoke a tool by its local (unprefixed) name.
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<ToolCallResult, TransportError>;

    /// Ping the backend to verify liveness, used by the Retry Supervisor
    /// and periodic health checks.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Tear down the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Outcome of a tool call, mirroring the spec's `ToolCallResult` shape
/// rather than rmcp's own (unknown content-item `type` values pass
/// through unchanged, per the pinned Open Question decision).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

/// Convert an rmcp `CallToolResult` into our wire shape, passing unknown
/// content-item variants through as raw JSON rather than dropping them.
pub fn map_call_tool_result(result: CallToolResult) -> ToolCallResult {
    let content = result
        .content
        .into_iter()
        .map(|item| serde_json::to_value(item).unwrap_or(Value::Null))
        .collect();
    ToolCallResult {
        content,
        is_error: result.is_error.unwrap_or(false),
    }
}

/// Enforce the backend's configured request deadline around one transport
/// call. `TransportError::Timeout` on expiry, per-backend `timeout`
/// otherwise left to the underlying client.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(TransportError::Timeout))
}

/// Build a `reqwest::Client` carrying the backend's static headers
/// (including any resolved ModelScope bearer token) as default headers,
/// used by both the SSE and StreamableHTTP transports.
pub(crate) fn http_client_with_headers(
    headers: &std::collections::HashMap<String, String>,
) -> Result<reqwest::Client, TransportError> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TransportError::ProtocolError(format!("invalid header name '{key}': {e}")))?;
        let val = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| TransportError::ProtocolError(format!("invalid header value for '{key}': {e}")))?;
        header_map.insert(name, val);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))
}

/// Construct the right transport for a backend's inferred kind (C1).
pub async fn connect_any(config: &BackendConfig) -> Result<Box<dyn Transport>, TransportError> {
    use crate::config::Transport as TransportKind;
    match config.transport {
        TransportKind::Stdio => Ok(Box::new(stdio::StdioTransport::connect(config).await?)),
        TransportKind::Sse => Ok(Box::new(sse::SseTransport::connect(config).await?)),
        TransportKind::StreamableHttp => {
            Ok(Box::new(http::StreamableHttpTransport::connect(config).await?))
        }
    }
}
