//! The aggregator gateway: singleton detection, port binding, background
//! loops, and the API server.
//!
//! Exactly one gateway should run per registry. Ownership is settled in
//! three steps so stale records never block a restart:
//! 1. Read the recorded owner and probe its identity route. A live owner
//!    answering with the gateway's recognizable identity wins; this
//!    process declines to bind and reports the owner's endpoint.
//! 2. No owner, or the probe failed: bind the preferred port, falling back
//!    to the next free port within a bounded window.
//! 3. The successful bind is authoritative. Record ownership, start the
//!    health-monitor and reaper loops, serve the API.
//!
//! On clean shutdown the ownership record is cleared only if it still
//! names this process; a crashed gateway leaves a stale record that the
//! identity probe invalidates on the next start.

pub mod api;

pub use api::GATEWAY_SERVICE_NAME;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::GatewayError;
use crate::monitor::HealthMonitor;
use crate::proxy::AggregatorProxy;
use crate::reaper::ZombieReaper;
use crate::registry::RegistryStore;

/// Timeout for the identity probe against a recorded owner.
const OWNER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a gateway start attempt.
#[derive(Debug)]
pub enum Startup {
    /// Another live gateway owns the registry; its endpoint is reported
    /// instead of binding a second one.
    AlreadyRunning { endpoint: String },
    /// This process bound the port and is serving.
    Running(RunningGateway),
}

/// A bound, serving gateway with its background loops.
#[derive(Debug)]
pub struct RunningGateway {
    endpoint: String,
    pid: u32,
    store: RegistryStore,
    server: JoinHandle<()>,
    monitor: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl RunningGateway {
    /// The endpoint actually bound, `host:port`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop serving: abort the loops and clear ownership if this process
    /// still holds it.
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        self.monitor.abort();
        self.reaper.abort();
        self.server.abort();
        self.store.clear_gateway_ownership(self.pid).await?;
        tracing::info!(endpoint = %self.endpoint, "gateway stopped");
        Ok(())
    }
}

/// Gateway starter: holds everything needed to settle ownership and serve.
pub struct Gateway {
    config: Config,
    store: RegistryStore,
    client: reqwest::Client,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let store = RegistryStore::open(config.base_dir())?.with_lock_timeout(config.lock_timeout());
        Ok(Self {
            config,
            store,
            client: reqwest::Client::new(),
        })
    }

    /// Start with an explicit store (shared with tests and embedders).
    pub fn with_store(config: Config, store: RegistryStore) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
        }
    }

    /// The registry this gateway serves.
    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Settle ownership and either report the live owner or bind and serve.
    pub async fn start(self) -> Result<Startup, GatewayError> {
        if let Some(owner) = self.store.gateway_ownership().await? {
            if self.probe_owner(&owner.endpoint).await {
                tracing::info!(endpoint = %owner.endpoint, "gateway already running");
                return Ok(Startup::AlreadyRunning {
                    endpoint: owner.endpoint,
                });
            }
            tracing::info!(
                endpoint = %owner.endpoint,
                pid = owner.pid,
                "stale gateway ownership record, taking over"
            );
        }

        let listener = self.bind_with_fallback().await?;
        let endpoint = listener.local_addr()?.to_string();
        let pid = std::process::id();
        self.store.set_gateway_ownership(pid, endpoint.clone()).await?;

        let proxy = AggregatorProxy::new(
            self.store.clone(),
            self.client.clone(),
            self.config.proxy_timeout(),
            self.config.kill_grace(),
        );
        let monitor = HealthMonitor::new(
            self.store.clone(),
            self.client.clone(),
            self.config.probe_interval(),
            self.config.probe_timeout(),
            self.config.probe_concurrency,
        );
        let reaper = ZombieReaper::new(
            self.store.clone(),
            self.config.reap_interval(),
            self.config.zombie_timeout(),
        );

        let app = api::router(api::AppState {
            store: self.store.clone(),
            proxy,
        });
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "gateway server exited");
            }
        });
        let monitor = tokio::spawn(monitor.run());
        let reaper = tokio::spawn(reaper.run());

        tracing::info!(%endpoint, pid, "gateway serving");
        Ok(Startup::Running(RunningGateway {
            endpoint,
            pid,
            store: self.store,
            server,
            monitor,
            reaper,
        }))
    }

    /// Check whether the recorded owner is a live gateway and not some
    /// unrelated process that reused the port.
    async fn probe_owner(&self, endpoint: &str) -> bool {
        let url = format!("http://{endpoint}/api/health");
        let response = match self
            .client
            .get(&url)
            .timeout(OWNER_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            _ => return false,
        };
        match response.json::<serde_json::Value>().await {
            Ok(body) => {
                body.get("service").and_then(|v| v.as_str()) == Some(GATEWAY_SERVICE_NAME)
            }
            Err(_) => false,
        }
    }

    /// Bind the preferred port, walking forward through the search window
    /// until a bind succeeds.
    async fn bind_with_fallback(&self) -> Result<TcpListener, GatewayError> {
        let start = self.config.port;
        let end = start.saturating_add(self.config.port_search_window);
        for port in start..end {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    if port != start {
                        tracing::info!(preferred = start, bound = port, "fell back to free port");
                    }
                    return Ok(listener);
                }
                Err(e) => {
                    tracing::debug!(port, error = %e, "port unavailable");
                }
            }
        }
        Err(GatewayError::NoFreePort { start, end })
    }
}
