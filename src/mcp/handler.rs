//! C8 MCP Message Handler: a hand-rolled JSON-RPC 2.0 dispatcher shared
//! across every Upstream Connection (C9) and the local `/mcp` control
//! surface endpoint. Exposes every prefixed tool directly rather than
//! the teacher's meta-tool-search layer (`server.rs`'s `ServerHandler`
//! with `#[tool_router]`) — the tool set here is dynamic and DashMap-
//! backed, not a fixed set of `#[tool]`-annotated methods, and rmcp's
//! `ServerHandler` assumes rmcp owns the transport, which conflicts with
//! C9 owning a raw outbound WebSocket and the control surface owning its
//! own HTTP framing.

use crate::error::RouterError;
use crate::router::{ToolFilter, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;
/// Reserved application-code range for routing/lifecycle faults that
/// aren't plain "unknown method" (ToolNotFound, ServiceUnavailable, ...).
const APPLICATION_ERROR: i64 = -32000;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

pub struct McpHandler {
    router: Arc<ToolRegistry>,
    server_name: String,
    server_version: String,
}

impl McpHandler {
    pub fn new(router: Arc<ToolRegistry>, server_name: String, server_version: String) -> Self {
        Self {
            router,
            server_name,
            server_version,
        }
    }

    /// Returns `None` for notifications (no `id`) — accepted but produce
    /// no response.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();

        if request.method.starts_with("notifications/") {
            return None;
        }

        let id = id?;

        let result = match request.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "tools/list" => Ok(self.tools_list().await),
            "tools/call" => self.tools_call(request.params).await,
            "ping" => Ok(serde_json::json!({})),
            _ => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("method not found: {}", request.method),
            }),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            },
            Err(error) => JsonRpcResponse {
                jsonrpc: "2.0",
                id,
                result: None,
                error: Some(error),
            },
        })
    }

    fn initialize(&self) -> Value {
        serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": self.server_name, "version": self.server_version},
        })
    }

    async fn tools_list(&self) -> Value {
        let tools = self.router.all_tools(ToolFilter::Enabled).await;
        serde_json::json!({ "tools": tools })
    }

    async fn tools_call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid_params("'name' must be a non-empty string"))?;

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(Value::Object(map.clone())),
            Some(_) => return Err(invalid_params("'arguments' must be an object")),
        };

        match self.router.call_tool(name, arguments).await {
            Ok(result) => serde_json::to_value(result).map_err(|e| JsonRpcError {
                code: APPLICATION_ERROR,
                message: e.to_string(),
            }),
            Err(RouterError::ToolNotFound(name)) => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("tool not found: {name}"),
            }),
            Err(e) => Err(JsonRpcError {
                code: APPLICATION_ERROR,
                message: e.to_string(),
            }),
        }
    }
}

fn invalid_params(message: &str) -> JsonRpcError {
    JsonRpcError {
        code: INVALID_PARAMS,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::backend::registry::ServiceRegistry;
    use crate::router::custom::{CustomToolHandler, DispatchToRouter};
    use crate::transport::ToolCallResult;
    use async_trait::async_trait;

    struct NoopDispatcher;

    #[async_trait]
    impl DispatchToRouter for NoopDispatcher {
        async fn call_tool(
            &self,
            prefixed_name: &str,
            _arguments: Option<Value>,
        ) -> Result<ToolCallResult, RouterError> {
            Err(RouterError::ToolNotFound(prefixed_name.to_string()))
        }
    }

    async fn handler() -> McpHandler {
        let dir = tempfile::tempdir().unwrap();
        let services = Arc::new(ServiceRegistry::new());
        let custom = Arc::new(CustomToolHandler::new(Arc::new(NoopDispatcher)));
        let audit = Arc::new(AuditLog::open(dir.path().join("tool-calls.jsonl"), 100).await.unwrap());
        let router = Arc::new(ToolRegistry::new(services, custom, audit));
        McpHandler::new(router, "xzcli".into(), "0.1.0".into())
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let handler = handler().await;
        let response = handler
            .handle(JsonRpcRequest {
                jsonrpc: None,
                id: None,
                method: "notifications/initialized".into(),
                params: None,
            })
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let handler = handler().await;
        let response = handler
            .handle(JsonRpcRequest {
                jsonrpc: None,
                id: Some(serde_json::json!(1)),
                method: "bogus".into(),
                params: None,
            })
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_call_missing_name_is_invalid_params() {
        let handler = handler().await;
        let response = handler
            .handle(JsonRpcRequest {
                jsonrpc: None,
                id: Some(serde_json::json!(1)),
                method: "tools/call".into(),
                params: Some(serde_json::json!({})),
            })
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let handler = handler().await;
        let response = handler
            .handle(JsonRpcRequest {
                jsonrpc: None,
                id: Some(serde_json::json!(1)),
                method: "ping".into(),
                params: None,
            })
            .await
            .unwrap();
        assert_eq!(response.result.unwrap(), serde_json::json!({}));
    }
}
