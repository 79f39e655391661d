//! Backend subsystem: Service (C3), Retry Supervisor (C4), Service
//! Registry (C5). Coordination between these three lives in
//! [`start_all`] and [`stop_all`], mirroring the teacher's
//! `backend/mod.rs::start_all` parallel-fan-out pattern.

pub mod registry;
pub mod service;
pub mod supervisor;

use crate::config::BackendConfig;
use crate::events::EventBus;
use registry::ServiceRegistry;
use service::Service;
use std::collections::HashMap;
use std::sync::Arc;
use supervisor::RetrySupervisor;
use tokio::task::JoinSet;
use tracing::warn;

/// Register every config, connect them all in parallel, and return the
/// names that failed (for the caller to feed into the Retry Supervisor).
/// Per-service failures do not fail the batch.
pub async fn start_all(
    registry: &Arc<ServiceRegistry>,
    events: &Arc<EventBus>,
    configs: HashMap<String, BackendConfig>,
) -> Vec<String> {
    let mut join_set = JoinSet::new();

    for (name, config) in configs {
        registry.add_config(config.clone());
        let service = Arc::new(Service::new(config, Arc::clone(events)));
        registry.add_service(Arc::clone(&service));
        join_set.spawn(async move {
            let result = service.connect().await;
            (name, result)
        });
    }

    let mut failed = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((name, Ok(()))) => {
                registry.rebuild_tool_index().await;
                let _ = name;
            }
            Ok((name, Err(e))) => {
                warn!(service = %name, error = %e, "backend failed to start");
                failed.push(name);
            }
            Err(e) => warn!(error = %e, "backend start task panicked"),
        }
    }
    registry.rebuild_tool_index().await;
    failed
}

/// Cooperatively disconnect every known service and cancel all retry
/// timers.
pub async fn stop_all(registry: &Arc<ServiceRegistry>, supervisor: &Arc<RetrySupervisor>) {
    supervisor.stop_all().await;
    for name in registry.all_service_names() {
        if let Some(service) = registry.get_service(&name).await {
            service.disconnect("shutdown").await;
        }
    }
    registry.rebuild_tool_index().await;
}
