//! Local HTTP/WebSocket control surface. Grounded on the teacher's
//! `admin.rs` axum scaffolding, extended with the handlers spec §6
//! requires: config read/write, status, tool invocation, filterable
//! tool listing, `/mcp` POST+GET, and a root WebSocket for status pushes.

use crate::audit::AuditLog;
use crate::backend::registry::ServiceRegistry;
use crate::config::Config;
use crate::events::EventBus;
use crate::mcp::handler::{JsonRpcRequest, McpHandler};
use crate::router::{ToolFilter, ToolRegistry};
use crate::upstream::manager::UpstreamManager;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

pub struct ControlState {
    pub config: Arc<arc_swap::ArcSwap<Config>>,
    pub services: Arc<ServiceRegistry>,
    pub router: Arc<ToolRegistry>,
    pub upstream: Arc<UpstreamManager>,
    pub mcp_handler: Arc<McpHandler>,
    pub audit: Arc<AuditLog>,
    pub events: Arc<EventBus>,
    pub bearer_token: Option<String>,
}

pub async fn start(
    state: Arc<ControlState>,
    listen: &str,
    shutdown: Arc<tokio::sync::Notify>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(status))
        .route("/config", get(get_config).put(put_config))
        .route("/tools", get(list_tools))
        .route("/tools/call", post(call_tool))
        .route("/mcp", get(mcp_status).post(mcp_post))
        .route("/", get(ws_status))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    Ok(())
}

fn check_auth(state: &ControlState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.bearer_token else {
        return Ok(());
    };
    let provided = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let connected = state.services.connected_services().await;
    let stats = state.upstream.stats().await;
    Json(serde_json::json!({
        "connectedBackends": connected,
        "upstream": {"healthy": stats.healthy, "total": stats.total},
        "toolCount": state.router.all_tools(ToolFilter::All).await.len(),
    }))
}

async fn get_config(
    headers: HeaderMap,
    State(state): State<Arc<ControlState>>,
) -> Result<impl IntoResponse, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json((**state.config.load()).clone()))
}

async fn put_config(
    headers: HeaderMap,
    State(state): State<Arc<ControlState>>,
    Json(new_config): Json<Config>,
) -> Result<impl IntoResponse, StatusCode> {
    check_auth(&state, &headers)?;
    state.config.store(Arc::new(new_config));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ToolsQuery {
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

async fn list_tools(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<ToolsQuery>,
) -> impl IntoResponse {
    let filter = match query.filter.as_deref() {
        Some("enabled") => ToolFilter::Enabled,
        Some("disabled") => ToolFilter::Disabled,
        _ => ToolFilter::All,
    };

    let tools = match query.search {
        Some(q) if !q.is_empty() => state.router.search(&q, 50).await,
        _ => state.router.all_tools(filter).await,
    };
    Json(tools)
}

#[derive(Deserialize)]
struct CallToolBody {
    name: String,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
}

async fn call_tool(
    headers: HeaderMap,
    State(state): State<Arc<ControlState>>,
    Json(body): Json<CallToolBody>,
) -> Result<impl IntoResponse, StatusCode> {
    check_auth(&state, &headers)?;
    match state.router.call_tool(&body.name, body.arguments).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            error!(tool = %body.name, error = %e, "control surface tool call failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn mcp_status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let stats = state.upstream.stats().await;
    Json(serde_json::json!({"status": "ok", "upstreamHealthy": stats.healthy}))
}

async fn mcp_post(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    match state.mcp_handler.handle(request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn ws_status(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ControlState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_status_loop(socket, state))
}

async fn push_status_loop(mut socket: WebSocket, state: Arc<ControlState>) {
    let mut endpoint_changes = state.events.subscribe_endpoint_status_changed();
    loop {
        let stats = state.upstream.stats().await;
        let payload = serde_json::json!({"healthy": stats.healthy, "total": stats.total});
        if socket
            .send(Message::Text(payload.to_string().into()))
            .await
            .is_err()
        {
            return;
        }

        tokio::select! {
            changed = endpoint_changes.recv() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
        }
    }
}
