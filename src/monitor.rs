//! Periodic liveness probing of registered instances.
//!
//! Each sweep probes every registered endpoint's `/health` route with a
//! short per-request timeout and bounded concurrency. A reachable instance
//! gets its heartbeat refreshed; an unreachable one is marked zombie. The
//! sweep never removes records, so detection latency is bounded by the
//! probe interval and removal stays with the reaper and force-kill paths.

use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::registry::RegistryStore;

/// Health-probe loop over the registry.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    store: RegistryStore,
    client: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
    concurrency: usize,
}

impl HealthMonitor {
    pub fn new(
        store: RegistryStore,
        client: reqwest::Client,
        interval: Duration,
        probe_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            client,
            interval,
            probe_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Run sweeps forever at the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Run one probe sweep over the current instance list.
    ///
    /// A non-2xx `/health` response counts as a failed probe: the route
    /// exists to report health, so an error status is itself the verdict.
    /// Pass-through calls judge the opposite way (any response proves the
    /// instance is alive) because they hit arbitrary routes.
    pub async fn tick(&self) {
        let instances = match self.store.list().await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(error = %e, "health sweep skipped, registry unavailable");
                return;
            }
        };
        if instances.is_empty() {
            return;
        }

        let results: Vec<(u32, bool)> = stream::iter(instances.into_iter().map(|record| {
            let client = self.client.clone();
            let timeout = self.probe_timeout;
            async move {
                let url = format!("http://{}/health", record.endpoint);
                let reachable = match client.get(&url).timeout(timeout).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(_) => false,
                };
                (record.pid, reachable)
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        for (pid, reachable) in results {
            let outcome = if reachable {
                self.store.touch(pid).await
            } else {
                tracing::info!(pid, "health probe failed, marking zombie");
                self.store.mark_zombie(pid).await
            };
            match outcome {
                Ok(()) => {}
                // The instance may have unregistered mid-sweep.
                Err(crate::error::RegistryError::NotFound { .. }) => {}
                Err(e) => tracing::warn!(pid, error = %e, "failed to record probe outcome"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceState;
    use axum::{Router, routing::get};
    use tempfile::TempDir;

    fn monitor(store: &RegistryStore) -> HealthMonitor {
        HealthMonitor::new(
            store.clone(),
            reqwest::Client::new(),
            Duration::from_secs(5),
            Duration::from_millis(500),
            4,
        )
    }

    async fn healthy_endpoint() -> String {
        let app = Router::new().route("/health", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    /// An address nothing listens on: bind, note the port, drop the socket.
    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_tick_touches_reachable_instance() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = healthy_endpoint().await;

        let before = store
            .register(1, endpoint, None, vec![])
            .await
            .unwrap()
            .last_heartbeat;

        monitor(&store).tick().await;

        let after = store.get(1).await.unwrap();
        assert_eq!(after.state, InstanceState::LiveNoProject);
        assert!(after.last_heartbeat >= before);
    }

    #[tokio::test]
    async fn test_one_tick_flips_unreachable_to_zombie() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = dead_endpoint().await;

        store.register(2, endpoint, None, vec![]).await.unwrap();
        monitor(&store).tick().await;

        let record = store.get(2).await.unwrap();
        assert_eq!(record.state, InstanceState::Zombie);
        assert!(record.zombie_detected_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_restores_zombie_that_answers_again() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = healthy_endpoint().await;

        store.register(3, endpoint, None, vec![]).await.unwrap();
        store.mark_zombie(3).await.unwrap();

        monitor(&store).tick().await;

        let record = store.get(3).await.unwrap();
        assert_eq!(record.state, InstanceState::LiveNoProject);
        assert_eq!(record.zombie_detected_at, None);
    }
}
