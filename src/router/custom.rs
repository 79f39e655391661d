//! C7 Custom Tool Handler: a second tool source with pluggable handler
//! kinds. Grounded structurally on the teacher's `backend/composite.rs`
//! virtual-`Backend` pattern, but the cyclic reference back into the
//! router (`mcp` kind re-enters C6 as a proxy) is broken with the narrow
//! [`DispatchToRouter`] trait object the Design Notes call for, instead
//! of a back-pointer to the whole `ToolRegistry`.

use crate::error::RouterError;
use crate::router::EnhancedTool;
use crate::transport::ToolCallResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Narrow callback the `mcp`-kind handler re-enters C6 through, instead
/// of holding a reference to the full `ToolRegistry` (which would create
/// a C6↔C7 cycle).
#[async_trait]
pub trait DispatchToRouter: Send + Sync {
    async fn call_tool(
        &self,
        prefixed_name: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResult, RouterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CustomHandlerKind {
    /// Forwards to an existing prefixed tool already known to the router.
    Mcp { service_name: String, tool_name: String },
    Coze { webhook_url: String },
    Dify { webhook_url: String },
    N8n { webhook_url: String },
    /// A stored response template; `{{argName}}` placeholders are
    /// substituted from the call's arguments.
    Inline { template: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub handler: CustomHandlerKind,
}

pub struct CustomToolHandler {
    tools: DashMap<String, CustomTool>,
    dispatcher: Arc<dyn DispatchToRouter>,
    http: reqwest::Client,
}

impl CustomToolHandler {
    pub fn new(dispatcher: Arc<dyn DispatchToRouter>) -> Self {
        Self {
            tools: DashMap::new(),
            dispatcher,
            http: reqwest::Client::new(),
        }
    }

    pub fn register(&self, tool: CustomTool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Custom tools are always enabled; list failure degrades to empty
    /// rather than propagating.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<EnhancedTool>> {
        Ok(self
            .tools
            .iter()
            .map(|e| EnhancedTool {
                name: e.value().name.clone(),
                description: e.value().description.clone(),
                input_schema: e.value().input_schema.clone(),
                enabled: true,
                server_name: None,
            })
            .collect())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResult, RouterError> {
        let tool = self
            .tools
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| RouterError::ToolNotFound(name.to_string()))?;

        match &tool.handler {
            CustomHandlerKind::Mcp { service_name, tool_name } => {
                let prefixed = crate::router::prefixed_name(service_name, tool_name);
                self.dispatcher.call_tool(&prefixed, arguments).await
            }
            CustomHandlerKind::Coze { webhook_url }
            | CustomHandlerKind::Dify { webhook_url }
            | CustomHandlerKind::N8n { webhook_url } => {
                self.call_webhook(webhook_url, arguments).await
            }
            CustomHandlerKind::Inline { template } => Ok(render_inline(template, arguments.as_ref())),
        }
    }

    async fn call_webhook(
        &self,
        url: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResult, RouterError> {
        let body = arguments.unwrap_or(Value::Object(Default::default()));
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::ServiceUnavailable(format!("webhook call failed: {e}")))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::String(String::new()));

        Ok(ToolCallResult {
            content: vec![serde_json::json!({"type": "text", "text": payload.to_string()})],
            is_error: !status.is_success(),
        })
    }
}

/// Substitute `{{key}}` placeholders in a string-shaped template with
/// the corresponding argument value; non-string templates pass through
/// unchanged.
fn render_inline(template: &Value, arguments: Option<&Value>) -> ToolCallResult {
    let rendered = match (template, arguments) {
        (Value::String(text), Some(Value::Object(args))) => {
            let mut out = text.clone();
            for (key, value) in args {
                let placeholder = format!("{{{{{key}}}}}");
                let replacement = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&placeholder, &replacement);
            }
            Value::String(out)
        }
        (other, _) => other.clone(),
    };

    ToolCallResult {
        content: vec![serde_json::json!({"type": "text", "text": rendered.to_string()})],
        is_error: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn inline_template_substitutes_args() {
        let handler = CustomToolHandler::new(Arc::new(NoopDispatcher));
        handler.register(CustomTool {
            name: "greet".to_string(),
            description: None,
            input_schema: serde_json::json!({}),
            handler: CustomHandlerKind::Inline {
                template: Value::String("hello {{name}}".to_string()),
            },
        });

        let result = handler
            .call_tool("greet", Some(serde_json::json!({"name": "world"})))
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn unknown_tool_not_found() {
        let handler = CustomToolHandler::new(Arc::new(NoopDispatcher));
        let err = handler.call_tool("missing", None).await.unwrap_err();
        assert!(matches!(err, RouterError::ToolNotFound(_)));
    }
}
