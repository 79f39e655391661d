//! Top-level configuration: the config file schema (spec §6), hot-reload
//! watcher, and secret/env interpolation. Transport-inference and
//! per-backend normalisation live in [`adapter`] (C1).

pub mod adapter;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use adapter::{BackendConfig, Transport};

/// Top-level xzcli configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream xiaozhi WebSocket endpoint(s). Accepts a single string or
    /// an array in the config file.
    #[serde(default, rename = "mcpEndpoint", with = "one_or_many")]
    pub mcp_endpoints: Vec<String>,

    /// Raw per-backend configs, normalised via [`adapter::normalize_batch`]
    /// after loading (kept as raw JSON here so hot-reload can re-normalise).
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, serde_json::Value>,

    /// Per-tool overrides: description/enable/usage stats (spec §4.6 self-heal).
    #[serde(default, rename = "mcpServerConfig")]
    pub mcp_server_config: HashMap<String, HashMap<String, ToolOverride>>,

    #[serde(default)]
    pub modelscope: ModelScopeConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub control: ControlConfig,

    /// Directory holding the append-only audit log and any other local
    /// state. Default: `~/.xzcli`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default = "default_max_audit_records")]
    pub max_audit_records: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelScopeConfig {
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
}

/// Connection settings for the Upstream Connection Manager (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_heartbeat_interval", with = "millis")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_health_check_interval", with = "millis")]
    pub health_check_interval: Duration,

    #[serde(default = "default_reconnect_interval", with = "millis")]
    pub reconnect_interval: Duration,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,

    #[serde(default = "default_connection_timeout", with = "millis")]
    pub connection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            health_check_interval: default_health_check_interval(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            load_balance_strategy: LoadBalanceStrategy::default(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastInflight,
}

/// Local HTTP/WebSocket control surface (collaborator; core provides handlers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_control_listen")]
    pub listen: String,

    /// Bearer token accepted by the control surface. Never minted by the
    /// core — issuance is an explicit Non-goal.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_control_listen(),
            bearer_token: None,
        }
    }
}

/// A per-tool override carried in `mcpServerConfig.<service>.tools.<tool>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOverride {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_time: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_control_listen() -> String {
    "127.0.0.1:9999".to_string()
}
fn default_max_audit_records() -> usize {
    10_000
}

/// Accepts either a bare string or a list of strings for `mcpEndpoint`.
mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize, Serialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(v: &[String], s: S) -> Result<S::Ok, S::Error> {
        v.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match OneOrMany::deserialize(d)? {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        })
    }
}

/// Duration stored as milliseconds in the wire format, matching the
/// upstream config's `connection.*Interval` fields and S1's literal
/// `timeout:30000`.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Config {
    /// Load config from a YAML or JSON file (by extension), performing
    /// `${VAR}` interpolation from the process environment first.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let is_json = path.extension().is_some_and(|e| e == "json");
        let config: Config = if is_json {
            serde_json::from_str(&expanded)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            serde_yaml_ng::from_str(&expanded)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        };

        Ok(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".xzcli")
        })
    }

    /// Normalise `mcp_servers` into canonical [`BackendConfig`]s, resolving
    /// Stdio script-path args relative to `config_dir`. Fails fast on the
    /// first invalid entry (C1 `normalizeBatch`).
    pub fn normalized_backends(&self, config_dir: &Path) -> Result<HashMap<String, BackendConfig>> {
        adapter::normalize_batch(&self.mcp_servers, config_dir, self.modelscope.api_key.as_deref())
    }
}

/// Diff between old and new normalised backend sets, driving hot-reload.
pub struct ConfigDiff {
    pub added: Vec<(String, BackendConfig)>,
    pub removed: Vec<String>,
    pub changed: Vec<(String, BackendConfig)>,
}

pub fn diff_backends(
    old: &HashMap<String, BackendConfig>,
    new: &HashMap<String, BackendConfig>,
) -> ConfigDiff {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    let mut removed = Vec::new();

    for (name, new_config) in new {
        match old.get(name) {
            None => added.push((name.clone(), new_config.clone())),
            Some(old_config) if old_config != new_config => {
                changed.push((name.clone(), new_config.clone()));
            }
            _ => {}
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            removed.push(name.clone());
        }
    }

    ConfigDiff {
        added,
        removed,
        changed,
    }
}

/// Watches the config file and pushes diffed backend changes into the
/// Service Registry (C5) + Retry Supervisor (C4), debouncing rapid-fire
/// filesystem events the way `notify` reports them in bursts.
pub async fn watch_config(
    config_path: PathBuf,
    current: Arc<arc_swap::ArcSwap<Config>>,
    on_diff: impl Fn(ConfigDiff) + Send + Sync + 'static,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        error!(path = %config_path.display(), error = %e, "failed to watch config file");
        return;
    }

    info!(path = %config_path.display(), "config file watcher started");
    let debounce = Duration::from_millis(500);
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("config file changed, reloading");
                let new_config = match Config::load(&config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to parse new config, keeping current");
                        continue;
                    }
                };
                let old_backends = match current.load().normalized_backends(&config_dir) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(error = %e, "current config failed to renormalise, skipping diff");
                        continue;
                    }
                };
                let new_backends = match new_config.normalized_backends(&config_dir) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(error = %e, "new config failed to normalise, keeping current");
                        continue;
                    }
                };

                let diff = diff_backends(&old_backends, &new_backends);
                current.store(Arc::new(new_config));
                on_diff(diff);
            }
            _ = shutdown.notified() => {
                info!("config watcher shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
mcpEndpoint: "wss://api.xiaozhi.me/mcp/?token=abc"
mcpServers:
  calculator:
    command: node
    args: ["calculator.js"]
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.mcp_endpoints, vec!["wss://api.xiaozhi.me/mcp/?token=abc"]);
        assert_eq!(config.mcp_servers.len(), 1);
    }

    #[test]
    fn test_parse_multi_endpoint() {
        let yaml = r#"
mcpEndpoint:
  - "wss://a.example.com/mcp"
  - "wss://b.example.com/mcp"
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.mcp_endpoints.len(), 2);
    }

    #[test]
    fn test_diff_backends() {
        let mut old = HashMap::new();
        old.insert(
            "a".to_string(),
            adapter::test_support::stdio_config("a", "node"),
        );
        let mut new = HashMap::new();
        new.insert(
            "a".to_string(),
            adapter::test_support::stdio_config("a", "python"),
        );
        new.insert("b".to_string(), adapter::test_support::stdio_config("b", "node"));

        let diff = diff_backends(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.removed.len(), 0);
    }
}
