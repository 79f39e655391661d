//! C4 Retry Supervisor: per-service exponential-backoff restart loop.
//! Grounded directly on the teacher's `backend/health.rs` circuit-breaker
//! / staggered-restart loop, generalized from the teacher's fixed
//! health categories to the spec's single `failed: set<Name>` + per-name
//! timer model.

use crate::backend::registry::ServiceRegistry;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MIN_INITIAL_DELAY: Duration = Duration::from_secs(30);
const MAX_INITIAL_DELAY: Duration = Duration::from_secs(90);
const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

struct Timer {
    handle: JoinHandle<()>,
    cancel: Arc<Notify>,
}

pub struct RetrySupervisor {
    registry: Arc<ServiceRegistry>,
    failed: Mutex<HashSet<String>>,
    timers: Mutex<std::collections::HashMap<String, Timer>>,
}

impl RetrySupervisor {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            failed: Mutex::new(HashSet::new()),
            timers: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Stable hash-seeded first delay in [30s, 90s], staggering restarts
    /// across services so they don't all retry in lockstep.
    fn initial_delay(name: &str) -> Duration {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let span = (MAX_INITIAL_DELAY - MIN_INITIAL_DELAY).as_millis() as u64;
        let offset = hasher.finish() % span.max(1);
        MIN_INITIAL_DELAY + Duration::from_millis(offset)
    }

    fn next_delay(current: Duration) -> Duration {
        (current * 2).min(MAX_DELAY)
    }

    /// Batch-schedule retries for a set of newly failed services.
    pub async fn schedule_failed_services_retry(self: &Arc<Self>, names: &[String]) {
        for name in names {
            self.schedule_retry(name.clone(), Self::initial_delay(name)).await;
        }
    }

    async fn schedule_retry(self: &Arc<Self>, name: String, delay: Duration) {
        {
            let mut failed = self.failed.lock().await;
            failed.insert(name.clone());
        }
        self.stop_retry(&name).await;

        let cancel = Arc::new(Notify::new());
        let this = Arc::clone(self);
        let timer_name = name.clone();
        let timer_cancel = Arc::clone(&cancel);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    this.attempt_restart(timer_name, delay).await;
                }
                _ = timer_cancel.notified() => {}
            }
        });

        self.timers
            .lock()
            .await
            .insert(name, Timer { handle, cancel });
    }

    async fn attempt_restart(self: Arc<Self>, name: String, last_delay: Duration) {
        let service = match self.registry.get_service(&name).await {
            Some(s) => s,
            None => return,
        };

        info!(service = %name, "retry supervisor attempting restart");
        match service.connect().await {
            Ok(()) => {
                self.failed.lock().await.remove(&name);
                self.timers.lock().await.remove(&name);
                info!(service = %name, "retry supervisor restart succeeded");
            }
            Err(e) => {
                warn!(service = %name, error = %e, "retry supervisor restart failed, rescheduling");
                let next = Self::next_delay(last_delay);
                self.schedule_retry(name, next).await;
            }
        }
    }

    /// Idempotent: cancelling an unscheduled name is a no-op.
    pub async fn stop_retry(&self, name: &str) {
        if let Some(timer) = self.timers.lock().await.remove(name) {
            timer.cancel.notify_one();
            timer.handle.abort();
        }
    }

    /// Idempotent.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.timers.lock().await.keys().cloned().collect();
        for name in names {
            self.stop_retry(&name).await;
        }
    }

    pub async fn failed_services(&self) -> Vec<String> {
        self.failed.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_delay_is_within_bounds() {
        for name in ["a", "backend-two", "some-really-long-service-name"] {
            let delay = RetrySupervisor::initial_delay(name);
            assert!(delay >= MIN_INITIAL_DELAY && delay <= MAX_INITIAL_DELAY);
        }
    }

    #[test]
    fn initial_delay_is_deterministic() {
        assert_eq!(
            RetrySupervisor::initial_delay("calculator"),
            RetrySupervisor::initial_delay("calculator")
        );
    }

    #[test]
    fn delay_doubles_and_caps() {
        let mut delay = Duration::from_secs(30);
        for _ in 0..20 {
            delay = RetrySupervisor::next_delay(delay);
        }
        assert_eq!(delay, MAX_DELAY);
    }
}
