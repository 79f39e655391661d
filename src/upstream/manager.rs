//! C10 Upstream Connection Manager: pool of C9 instances, one per
//! endpoint URL. Grounded structurally on the teacher's `BackendManager`
//! DashMap-of-handles + JoinSet-fan-out-start pattern, applied to
//! outbound WebSocket endpoints instead of inbound backend processes;
//! health-check loop and reconnect backoff grounded on
//! `backend/health.rs`'s staggered ping loop.

use crate::config::{ConnectionConfig, LoadBalanceStrategy};
use crate::events::EventBus;
use crate::mcp::handler::McpHandler;
use crate::upstream::connection::{ConnectionState, UpstreamConnection};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

const HEALTH_CHECK_UNHEALTHY_THRESHOLD: u32 = 2;
const PLACEHOLDER_SENTINEL: &str = "<请填写";

pub struct ManagerStats {
    pub healthy: usize,
    pub total: usize,
}

pub struct UpstreamManager {
    connections: DashMap<String, Arc<UpstreamConnection>>,
    handler: Arc<McpHandler>,
    events: Arc<EventBus>,
    config: ConnectionConfig,
    round_robin_cursor: AtomicUsize,
}

impl UpstreamManager {
    /// Validate and create C9 instances, filtering placeholder endpoints.
    pub fn initialize(
        endpoints: &[String],
        handler: Arc<McpHandler>,
        events: Arc<EventBus>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let connections = DashMap::new();
        for endpoint in endpoints {
            if endpoint.contains(PLACEHOLDER_SENTINEL) {
                warn!(endpoint, "skipping placeholder upstream endpoint");
                continue;
            }
            connections.insert(endpoint.clone(), UpstreamConnection::new(endpoint.clone(), Arc::clone(&events)));
        }

        Arc::new(Self {
            connections,
            handler,
            events,
            config,
            round_robin_cursor: AtomicUsize::new(0),
        })
    }

    /// Parallel connect-with-retry across all endpoints. Per-endpoint
    /// failures don't fail the batch; the health/reconnect loop picks
    /// them back up.
    pub async fn connect(self: &Arc<Self>) {
        let mut join_set = JoinSet::new();
        for entry in self.connections.iter() {
            let connection = Arc::clone(entry.value());
            let handler = Arc::clone(&self.handler);
            join_set.spawn(async move {
                let endpoint = connection.endpoint.clone();
                let result = connection.connect(handler).await;
                (endpoint, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Ok((endpoint, Err(e))) = joined {
                warn!(endpoint, error = %e, "initial upstream connect failed, reconnect loop will retry");
            }
        }
    }

    /// Load-balance over currently *healthy* (Connected) connections
    /// using the configured strategy.
    pub async fn select_best_connection(&self) -> Option<Arc<UpstreamConnection>> {
        let mut healthy = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().state().await == ConnectionState::Connected {
                healthy.push(Arc::clone(entry.value()));
            }
        }
        if healthy.is_empty() {
            return None;
        }

        match self.config.load_balance_strategy {
            LoadBalanceStrategy::RoundRobin => {
                let index = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Some(Arc::clone(&healthy[index]))
            }
            LoadBalanceStrategy::Random => {
                let index = stable_pseudo_random(healthy.len());
                Some(Arc::clone(&healthy[index]))
            }
            LoadBalanceStrategy::LeastInflight => healthy
                .iter()
                .min_by_key(|c| c.inflight_count())
                .map(Arc::clone),
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let mut healthy = 0;
        let total = self.connections.len();
        for entry in self.connections.iter() {
            if entry.value().state().await == ConnectionState::Connected {
                healthy += 1;
            }
        }
        ManagerStats { healthy, total }
    }

    /// Runs until `shutdown` fires: every `healthCheckInterval`, ping
    /// every connection; on two consecutive failures mark unhealthy and
    /// trigger a reconnect with exponential backoff capped at
    /// `maxReconnectAttempts`.
    pub async fn run_health_check_loop(self: Arc<Self>, shutdown: Arc<tokio::sync::Notify>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for entry in self.connections.iter() {
                        let connection = Arc::clone(entry.value());
                        if connection.state().await != ConnectionState::Connected {
                            continue;
                        }
                        let succeeded = connection.send_ping(self.config.connection_timeout).await;
                        let failures = connection.record_ping_result(succeeded);
                        if failures >= HEALTH_CHECK_UNHEALTHY_THRESHOLD {
                            connection.mark_unhealthy().await;
                            let this = Arc::clone(&self);
                            tokio::spawn(async move { this.reconnect(connection).await });
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("health check loop shutting down");
                    return;
                }
            }
        }
    }

    async fn reconnect(self: Arc<Self>, connection: Arc<UpstreamConnection>) {
        let base = self.config.reconnect_interval;
        let max_attempts = self.config.max_reconnect_attempts;

        loop {
            let attempt = connection.reconnect_attempt();
            if attempt >= max_attempts {
                warn!(endpoint = %connection.endpoint, attempt, "upstream reconnect attempts exhausted");
                return;
            }

            let delay = base.saturating_mul(2u32.saturating_pow(attempt.min(10)));
            tokio::time::sleep(delay).await;

            match connection.connect(Arc::clone(&self.handler)).await {
                Ok(()) => {
                    info!(endpoint = %connection.endpoint, "upstream reconnected");
                    return;
                }
                Err(e) => {
                    warn!(endpoint = %connection.endpoint, error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    /// Close all connections cooperatively within a 2s grace window;
    /// survivors are force-dropped.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<UpstreamConnection>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();

        let closes = connections.iter().map(|c| c.close());
        let _ = tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(closes)).await;
    }
}

fn stable_pseudo_random(len: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    crate::audit::now_millis().hash(&mut hasher);
    (hasher.finish() as usize) % len.max(1)
}
