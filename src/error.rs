//! Error taxonomy (spec §7). Each kind names its origin component; the
//! disposition (recover locally vs. surface to caller) lives in the
//! callers, not in these types.

use thiserror::Error;

/// C1/C2: malformed config or missing transport-specific requirement.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backend '{name}': name must not be empty")]
    EmptyName { name: String },

    #[error("backend '{name}': stdio transport requires a non-empty 'command'")]
    MissingCommand { name: String },

    #[error("backend '{name}': url-bearing transport requires a parseable 'url'")]
    MissingOrInvalidUrl { name: String },

    #[error("backend '{name}': unrecognised 'transport' value, expected stdio/sse/streamableHttp")]
    InvalidTransport { name: String },

    #[error("backend '{name}': raw config was null")]
    NullConfig { name: String },

    #[error(
        "backend '{name}': ModelScope SSE endpoint requires a bearer token \
         (headers.Authorization, apiKey, config modelscope.apiKey, or MODELSCOPE_API_TOKEN)"
    )]
    MissingModelScopeAuth { name: String },
}

/// C2: transport-level failure kinds, uniform across Stdio/SSE/StreamableHTTP.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("channel closed")]
    Closed,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("request timed out")]
    Timeout,
}

/// C6: routing failures surfaced to callers as JSON-RPC errors.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("service '{0}' is not available")]
    ServiceUnavailable(String),

    #[error("service '{0}' is not connected")]
    ServiceNotConnected(String),
}

/// C9/C10: upstream WebSocket lifecycle failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream '{0}' disconnected")]
    Disconnected(String),

    #[error("upstream connect failed: {0}")]
    ConnectFailed(String),

    #[error("endpoint url invalid: {0}")]
    InvalidEndpoint(String),
}
