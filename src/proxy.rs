//! Pass-through operations against individual instances.
//!
//! The proxy is how the gateway reaches into one tracked instance: logs,
//! tool statistics, configuration, execution state, and shutdown are all
//! forwarded to the instance's own local HTTP API. Every forwarded call
//! doubles as a liveness signal: success refreshes the heartbeat, failure
//! marks the record zombie, and a record already known to be a zombie is
//! rejected without a network attempt. Failures are definitive, never
//! retried inline; the next health sweep or call re-evaluates.

use std::time::Duration;

use reqwest::Method;

use crate::error::{ProxyError, RegistryError};
use crate::registry::{InstanceRecord, InstanceState, RegistryStore};

/// Typed client for forwarded per-instance calls.
#[derive(Debug, Clone)]
pub struct AggregatorProxy {
    store: RegistryStore,
    client: reqwest::Client,
    timeout: Duration,
    kill_grace: Duration,
}

impl AggregatorProxy {
    pub fn new(
        store: RegistryStore,
        client: reqwest::Client,
        timeout: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            store,
            client,
            timeout,
            kill_grace,
        }
    }

    /// Recent log lines from the instance.
    pub async fn fetch_logs(&self, pid: u32) -> Result<serde_json::Value, ProxyError> {
        self.passthrough(pid, Method::GET, "/logs").await
    }

    /// Per-tool usage counters from the instance.
    pub async fn tool_stats(&self, pid: u32) -> Result<serde_json::Value, ProxyError> {
        self.passthrough(pid, Method::GET, "/tool-stats").await
    }

    /// Reset the instance's per-tool usage counters.
    pub async fn clear_tool_stats(&self, pid: u32) -> Result<serde_json::Value, ProxyError> {
        self.passthrough(pid, Method::DELETE, "/tool-stats").await
    }

    /// The instance's effective configuration overview.
    pub async fn config_overview(&self, pid: u32) -> Result<serde_json::Value, ProxyError> {
        self.passthrough(pid, Method::GET, "/config").await
    }

    /// Queued and most recent tool executions on the instance.
    pub async fn executions(&self, pid: u32) -> Result<serde_json::Value, ProxyError> {
        self.passthrough(pid, Method::GET, "/executions").await
    }

    /// Ask the instance to shut down, then drop its record.
    ///
    /// The record is removed whether or not the instance acknowledged: a
    /// shutdown that raced a crash must not leak a live-looking record.
    pub async fn shutdown(&self, pid: u32) -> Result<(), ProxyError> {
        let record = self.resolve_live(pid).await?;

        let url = format!("http://{}/shutdown", record.endpoint);
        let result = self
            .client
            .put(&url)
            .timeout(self.timeout)
            .send()
            .await;
        if let Err(e) = &result {
            tracing::warn!(pid, error = %e, "shutdown request not acknowledged");
        }

        self.store.unregister(pid).await?;
        Ok(())
    }

    /// Forcibly terminate a zombie's process.
    ///
    /// Only valid in `Zombie` state; anything else is an
    /// `InvalidTransition` and leaves the record unmodified. The attempt
    /// escalates SIGTERM to SIGKILL after a grace period, records a
    /// `ForceKilled` event win or lose, and removes the record only on
    /// success. Returns whether the process is gone.
    pub async fn force_kill(&self, pid: u32) -> Result<bool, ProxyError> {
        let record = self.get_record(pid).await?;
        if record.state != InstanceState::Zombie {
            return Err(ProxyError::InvalidTransition {
                pid,
                state: record.state.as_str(),
                action: "force-kill",
            });
        }

        let killed = kill_with_escalation(pid, self.kill_grace).await;
        self.store.record_force_kill(pid, killed).await?;
        if killed {
            tracing::info!(pid, "force-killed zombie instance");
        } else {
            tracing::warn!(pid, "force-kill did not terminate the process");
        }
        Ok(killed)
    }

    /// One forwarded request: resolve, short-circuit zombies, call with a
    /// bounded timeout, touch on success, mark zombie on failure.
    async fn passthrough(
        &self,
        pid: u32,
        method: Method,
        path: &'static str,
    ) -> Result<serde_json::Value, ProxyError> {
        let record = self.resolve_live(pid).await?;
        let url = format!("http://{}{}", record.endpoint, path);

        let response = match self
            .client
            .request(method, &url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.store.mark_zombie(pid).await?;
                return Err(ProxyError::Unreachable {
                    pid,
                    reason: e.to_string(),
                });
            }
        };

        // The instance answered, so it is alive even if the route errored.
        self.touch_quietly(pid).await;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Unreachable {
                pid,
                reason: format!("instance returned {status} for {path}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProxyError::Unreachable {
                pid,
                reason: format!("invalid response body: {e}"),
            })
    }

    async fn get_record(&self, pid: u32) -> Result<InstanceRecord, ProxyError> {
        match self.store.get(pid).await {
            Ok(record) => Ok(record),
            Err(RegistryError::NotFound { pid }) => Err(ProxyError::NotFound { pid }),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a pid, rejecting zombies before any network traffic.
    async fn resolve_live(&self, pid: u32) -> Result<InstanceRecord, ProxyError> {
        let record = self.get_record(pid).await?;
        if record.state == InstanceState::Zombie {
            return Err(ProxyError::Unreachable {
                pid,
                reason: "instance is marked zombie".to_string(),
            });
        }
        Ok(record)
    }

    async fn touch_quietly(&self, pid: u32) {
        match self.store.touch(pid).await {
            Ok(()) => {}
            // Unregistered between the call and the touch.
            Err(RegistryError::NotFound { .. }) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to refresh heartbeat"),
        }
    }
}

/// SIGTERM, wait out the grace period, SIGKILL if still alive. Returns
/// whether the process is gone afterwards.
#[cfg(unix)]
async fn kill_with_escalation(pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    let alive = |target| signal::kill(target, None).is_ok();

    if signal::kill(target, Signal::SIGTERM).is_err() {
        // ESRCH means it already exited, which is what we wanted.
        return !alive(target);
    }
    tokio::time::sleep(grace).await;
    if !alive(target) {
        return true;
    }

    tracing::warn!(pid, "SIGTERM ignored, escalating to SIGKILL");
    let _ = signal::kill(target, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_millis(100)).await;
    !alive(target)
}

#[cfg(not(unix))]
async fn kill_with_escalation(_pid: u32, _grace: Duration) -> bool {
    tracing::warn!("force-kill is only supported on unix");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LifecycleEventKind;
    use axum::{
        Router,
        routing::{get, put},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn proxy(store: &RegistryStore) -> AggregatorProxy {
        AggregatorProxy::new(
            store.clone(),
            reqwest::Client::new(),
            Duration::from_millis(500),
            Duration::from_millis(50),
        )
    }

    /// Serve a minimal instance API on an ephemeral port.
    async fn fake_instance() -> String {
        let app = Router::new()
            .route("/logs", get(|| async { axum::Json(json!({"lines": ["a", "b"]})) }))
            .route(
                "/tool-stats",
                get(|| async { axum::Json(json!({"calls": 3})) })
                    .delete(|| async { axum::Json(json!({"cleared": true})) }),
            )
            .route("/shutdown", put(|| async { axum::Json(json!({"ok": true})) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_passthrough_returns_body_and_touches() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = fake_instance().await;
        let before = store
            .register(10, endpoint, None, vec![])
            .await
            .unwrap()
            .last_heartbeat;

        let logs = proxy(&store).fetch_logs(10).await.unwrap();
        assert_eq!(logs, json!({"lines": ["a", "b"]}));

        let record = store.get(10).await.unwrap();
        assert!(record.last_heartbeat >= before);
        assert_eq!(record.state, InstanceState::LiveNoProject);
    }

    #[tokio::test]
    async fn test_clear_tool_stats_uses_delete() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = fake_instance().await;
        store.register(11, endpoint, None, vec![]).await.unwrap();

        let cleared = proxy(&store).clear_tool_stats(11).await.unwrap();
        assert_eq!(cleared, json!({"cleared": true}));
    }

    #[tokio::test]
    async fn test_unknown_pid_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();

        let err = proxy(&store).fetch_logs(404).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { pid: 404 }));
    }

    #[tokio::test]
    async fn test_zombie_short_circuits_without_network() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        // Endpoint that would hang or refuse; the call must not reach it.
        store
            .register(12, "127.0.0.1:1", None, vec![])
            .await
            .unwrap();
        store.mark_zombie(12).await.unwrap();

        let started = std::time::Instant::now();
        let err = proxy(&store).fetch_logs(12).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unreachable { pid: 12, .. }));
        // No timeout was consumed.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_network_failure_marks_zombie() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = dead_endpoint().await;
        store.register(13, endpoint, None, vec![]).await.unwrap();

        let err = proxy(&store).fetch_logs(13).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unreachable { pid: 13, .. }));
        assert_eq!(store.get(13).await.unwrap().state, InstanceState::Zombie);
    }

    #[tokio::test]
    async fn test_force_kill_rejected_outside_zombie_state() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        store
            .register(14, "127.0.0.1:1", None, vec![])
            .await
            .unwrap();

        let err = proxy(&store).force_kill(14).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::InvalidTransition {
                pid: 14,
                state: "live_no_project",
                action: "force-kill",
            }
        ));

        // Record untouched, no force-kill event recorded.
        assert_eq!(
            store.get(14).await.unwrap().state,
            InstanceState::LiveNoProject
        );
        let kinds: Vec<_> = store
            .events(100)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(!kinds.contains(&LifecycleEventKind::ForceKilled));
    }

    #[tokio::test]
    async fn test_shutdown_unregisters_even_when_unacknowledged() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = dead_endpoint().await;
        store.register(15, endpoint, None, vec![]).await.unwrap();

        proxy(&store).shutdown(15).await.unwrap();

        assert!(store.get(15).await.is_err());
        let kinds: Vec<_> = store
            .events(100)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&LifecycleEventKind::Stopped));
    }

    #[tokio::test]
    async fn test_shutdown_forwards_then_removes() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let endpoint = fake_instance().await;
        store.register(16, endpoint, None, vec![]).await.unwrap();

        proxy(&store).shutdown(16).await.unwrap();
        assert!(matches!(
            store.get(16).await.unwrap_err(),
            RegistryError::NotFound { pid: 16 }
        ));
    }
}
