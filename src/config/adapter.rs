//! C1 Config Adapter: turns the raw, loosely-typed JSON values under
//! `mcpServers` into canonical [`BackendConfig`]s, inferring the transport
//! and resolving ModelScope auth. This is the single place that knows the
//! raw config schema; everything downstream works with the typed form.

use crate::config::millis;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Canonical, normalised form of a single backend entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub transport: Transport,

    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(with = "millis")]
    pub timeout: Duration,

    /// True when `url`'s host was recognised as a ModelScope endpoint and
    /// auth resolution (headers.Authorization > apiKey > global
    /// modelscope.apiKey > MODELSCOPE_API_TOKEN) applied.
    #[serde(default)]
    pub model_scope_auth: bool,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw shape accepted in `mcpServers.<name>`, deserialised loosely so
/// missing/extra fields don't abort parsing before normalisation can
/// produce a proper [`ConfigError`].
#[derive(Debug, Default, Deserialize)]
struct RawBackend {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    transport: Option<String>,
}

/// Parse an explicit `transport` discriminator. Accepts the handful of
/// spellings a hand-written config is likely to use for each kind.
fn parse_transport_kind(raw: &str, name: &str) -> Result<Transport, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "stdio" => Ok(Transport::Stdio),
        "sse" => Ok(Transport::Sse),
        "streamablehttp" | "streamable-http" | "http" | "streamable_http" => {
            Ok(Transport::StreamableHttp)
        }
        _ => Err(ConfigError::InvalidTransport {
            name: name.to_string(),
        }),
    }
}

/// Normalise a single raw backend config entry.
///
/// Transport inference: an explicit `transport` field always wins.
/// Otherwise, presence of `command` means Stdio; otherwise the `url` is
/// parsed and a path ending in `/sse` (case-sensitive, no trailing-slash
/// tolerance) means SSE, else StreamableHTTP.
pub fn normalize(
    name: &str,
    raw: &serde_json::Value,
    config_dir: &Path,
    global_modelscope_key: Option<&str>,
) -> Result<BackendConfig, ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::EmptyName {
            name: name.to_string(),
        });
    }
    if raw.is_null() {
        return Err(ConfigError::NullConfig {
            name: name.to_string(),
        });
    }

    let parsed: RawBackend =
        serde_json::from_value(raw.clone()).map_err(|_| ConfigError::NullConfig {
            name: name.to_string(),
        })?;

    let timeout = parsed
        .timeout
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);

    let explicit_transport = parsed
        .transport
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|t| parse_transport_kind(t, name))
        .transpose()?;

    let wants_stdio = match explicit_transport {
        Some(Transport::Stdio) => true,
        Some(_) => false,
        None => parsed.command.as_deref().is_some_and(|c| !c.is_empty()),
    };

    if wants_stdio {
        let command = parsed
            .command
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ConfigError::MissingCommand {
                name: name.to_string(),
            })?;
        let args = parsed
            .args
            .into_iter()
            .map(|arg| resolve_stdio_arg(arg, config_dir))
            .collect();

        return Ok(BackendConfig {
            name: name.to_string(),
            transport: Transport::Stdio,
            command: Some(command),
            args,
            env: parsed.env,
            cwd: parsed.cwd.map(PathBuf::from),
            url: None,
            headers: parsed.headers,
            api_key: parsed.api_key,
            timeout,
            model_scope_auth: false,
        });
    }

    // No command (or explicit non-stdio transport) -> URL-bearing transport.
    let raw_url = parsed.url.ok_or_else(|| ConfigError::MissingCommand {
        name: name.to_string(),
    })?;
    let parsed_url = url::Url::parse(&raw_url).map_err(|_| ConfigError::MissingOrInvalidUrl {
        name: name.to_string(),
    })?;

    let transport = explicit_transport.unwrap_or_else(|| {
        if parsed_url.path().ends_with("/sse") {
            Transport::Sse
        } else {
            Transport::StreamableHttp
        }
    });

    let model_scope_auth = is_modelscope_host(parsed_url.host_str().unwrap_or(""));

    let mut headers = parsed.headers;
    let mut api_key = parsed.api_key;

    if model_scope_auth {
        let resolved = resolve_modelscope_auth(&headers, api_key.as_deref(), global_modelscope_key)
            .ok_or_else(|| ConfigError::MissingModelScopeAuth {
                name: name.to_string(),
            })?;
        headers
            .entry("Authorization".to_string())
            .or_insert_with(|| format!("Bearer {resolved}"));
        api_key.get_or_insert(resolved);
    }

    Ok(BackendConfig {
        name: name.to_string(),
        transport,
        command: None,
        args: Vec::new(),
        env: HashMap::new(),
        cwd: None,
        url: Some(raw_url),
        headers,
        api_key,
        timeout,
        model_scope_auth,
    })
}

/// Normalise every entry in `raw`, failing on the first invalid one
/// (stable iteration order by sorted key, so errors are deterministic).
pub fn normalize_batch(
    raw: &HashMap<String, serde_json::Value>,
    config_dir: &Path,
    global_modelscope_key: Option<&str>,
) -> anyhow::Result<HashMap<String, BackendConfig>> {
    let mut names: Vec<&String> = raw.keys().collect();
    names.sort();

    let mut out = HashMap::with_capacity(raw.len());
    for name in names {
        let config = normalize(name, &raw[name], config_dir, global_modelscope_key)?;
        out.insert(name.clone(), config);
    }
    Ok(out)
}

/// One-line human-readable summary, used in status/log output.
pub fn describe(config: &BackendConfig) -> String {
    match config.transport {
        Transport::Stdio => format!(
            "{} (stdio: {} {})",
            config.name,
            config.command.as_deref().unwrap_or(""),
            config.args.join(" ")
        ),
        Transport::Sse => format!("{} (sse: {})", config.name, config.url.as_deref().unwrap_or("")),
        Transport::StreamableHttp => format!(
            "{} (streamable-http: {})",
            config.name,
            config.url.as_deref().unwrap_or("")
        ),
    }
}

const SCRIPT_SUFFIXES: [&str; 5] = [".js", ".ts", ".py", ".mjs", ".cjs"];

/// Resolve a Stdio arg that looks like a script path to an absolute path
/// relative to `config_dir`. Idempotent: already-absolute paths and
/// non-script args pass through unchanged.
fn resolve_stdio_arg(arg: String, config_dir: &Path) -> String {
    let looks_like_script = SCRIPT_SUFFIXES.iter().any(|suffix| arg.ends_with(suffix));
    if !looks_like_script {
        return arg;
    }
    let path = Path::new(&arg);
    if path.is_absolute() {
        return arg;
    }
    config_dir.join(path).to_string_lossy().into_owned()
}

fn is_modelscope_host(host: &str) -> bool {
    host == "modelscope.net"
        || host == "modelscope.cn"
        || host.ends_with(".modelscope.net")
        || host.ends_with(".modelscope.cn")
}

/// ModelScope auth precedence: explicit `headers.Authorization` > per-service
/// `apiKey` > global `modelscope.apiKey` > `MODELSCOPE_API_TOKEN` env var.
/// Returns the bearer token value (without the `Bearer ` prefix) if any
/// level provided one, after stripping an existing `Bearer ` prefix from
/// `headers.Authorization` if present.
fn resolve_modelscope_auth(
    headers: &HashMap<String, String>,
    api_key: Option<&str>,
    global_key: Option<&str>,
) -> Option<String> {
    if let Some(auth) = headers.get("Authorization") {
        return Some(
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .to_string(),
        );
    }
    if let Some(key) = api_key {
        return Some(key.to_string());
    }
    if let Some(key) = global_key {
        return Some(key.to_string());
    }
    std::env::var("MODELSCOPE_API_TOKEN").ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn stdio_config(name: &str, command: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: Transport::Stdio,
            command: Some(command.to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            model_scope_auth: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stdio_inferred_from_command() {
        let raw = json!({"command": "node", "args": ["server.js"]});
        let config = normalize("calc", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::Stdio);
        assert_eq!(config.args, vec!["/cfg/server.js".to_string()]);
    }

    #[test]
    fn stdio_arg_resolution_is_idempotent() {
        let raw = json!({"command": "node", "args": ["/abs/server.js"]});
        let config = normalize("calc", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.args, vec!["/abs/server.js".to_string()]);

        let reraw = serde_json::to_value(&config).unwrap();
        let reconfig = normalize("calc", &reraw, Path::new("/cfg"), None);
        assert!(reconfig.is_err() || reconfig.unwrap().args == config.args);
    }

    #[test]
    fn sse_inferred_from_url_suffix() {
        let raw = json!({"url": "https://example.com/mcp/sse"});
        let config = normalize("remote", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::Sse);
    }

    #[test]
    fn streamable_http_is_default_for_url_without_sse_suffix() {
        let raw = json!({"url": "https://example.com/mcp"});
        let config = normalize("remote", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
    }

    #[test]
    fn sse_suffix_check_is_case_and_slash_sensitive() {
        let raw = json!({"url": "https://example.com/mcp/SSE"});
        let config = normalize("remote", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);

        let raw = json!({"url": "https://example.com/mcp/sse/"});
        let config = normalize("remote", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
    }

    #[test]
    fn modelscope_host_requires_auth() {
        let raw = json!({"url": "https://api.modelscope.net/mcp"});
        let err = normalize("ms", &raw, Path::new("/cfg"), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingModelScopeAuth { .. }));
    }

    #[test]
    fn modelscope_auth_precedence_api_key_over_global() {
        let raw = json!({"url": "https://api.modelscope.cn/mcp", "apiKey": "svc-key"});
        let config = normalize("ms", &raw, Path::new("/cfg"), Some("global-key")).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("svc-key"));
    }

    #[test]
    fn modelscope_auth_falls_back_to_global_key() {
        let raw = json!({"url": "https://api.modelscope.cn/mcp"});
        let config = normalize("ms", &raw, Path::new("/cfg"), Some("global-key")).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("global-key"));
    }

    #[test]
    fn empty_name_rejected() {
        let raw = json!({"command": "node"});
        let err = normalize("", &raw, Path::new("/cfg"), None).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyName { .. }));
    }

    #[test]
    fn missing_url_and_command_rejected() {
        let raw = json!({});
        let err = normalize("x", &raw, Path::new("/cfg"), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCommand { .. }));
    }

    #[test]
    fn invalid_url_rejected() {
        let raw = json!({"url": "not a url"});
        let err = normalize("x", &raw, Path::new("/cfg"), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingOrInvalidUrl { .. }));
    }

    #[test]
    fn explicit_transport_overrides_sse_suffix_inference() {
        let raw = json!({"url": "https://example.com/mcp/sse", "transport": "streamableHttp"});
        let config = normalize("remote", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
    }

    #[test]
    fn explicit_transport_overrides_command_inference() {
        let raw = json!({
            "command": "node",
            "url": "https://example.com/mcp",
            "transport": "sse",
        });
        let config = normalize("remote", &raw, Path::new("/cfg"), None).unwrap();
        assert_eq!(config.transport, Transport::Sse);
    }

    #[test]
    fn unrecognised_transport_value_rejected() {
        let raw = json!({"url": "https://example.com/mcp", "transport": "carrier-pigeon"});
        let err = normalize("x", &raw, Path::new("/cfg"), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTransport { .. }));
    }

    #[test]
    fn normalize_batch_fails_fast_on_first_invalid() {
        let mut raw = HashMap::new();
        raw.insert("a".to_string(), json!({"command": "node"}));
        raw.insert("b".to_string(), json!({}));
        let result = normalize_batch(&raw, Path::new("/cfg"), None);
        assert!(result.is_err());
    }
}
