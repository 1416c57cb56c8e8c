//! End-to-end gateway tests: singleton ownership, port fallback, and the
//! HTTP API over a real registry directory.

use muster::{Config, Gateway, InstanceState, RegistryStore, Startup};
use tempfile::TempDir;

/// Config bound to a temp registry dir, binding an ephemeral port.
fn test_config(dir: &TempDir) -> Config {
    Config {
        base_dir: Some(dir.path().to_path_buf()),
        port: 0,
        port_search_window: 1,
        ..Config::default()
    }
}

fn store_for(dir: &TempDir) -> RegistryStore {
    RegistryStore::open(dir.path()).unwrap()
}

async fn start_running(config: Config, store: RegistryStore) -> muster::RunningGateway {
    match Gateway::with_store(config, store).start().await.unwrap() {
        Startup::Running(running) => running,
        Startup::AlreadyRunning { endpoint } => {
            panic!("expected a fresh bind, found owner at {endpoint}")
        }
    }
}

#[tokio::test]
async fn test_second_gateway_defers_to_live_owner() {
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir);

    let first = start_running(test_config(&dir), store.clone()).await;
    let owner_endpoint = first.endpoint().to_string();

    // Ownership is recorded for the bound endpoint.
    let ownership = store.gateway_ownership().await.unwrap().unwrap();
    assert_eq!(ownership.endpoint, owner_endpoint);

    // A second start probes the owner and declines to bind.
    let second = Gateway::with_store(test_config(&dir), store.clone())
        .start()
        .await
        .unwrap();
    match second {
        Startup::AlreadyRunning { endpoint } => assert_eq!(endpoint, owner_endpoint),
        Startup::Running(_) => panic!("second gateway bound despite a live owner"),
    }

    // Clean shutdown clears the ownership record.
    first.shutdown().await.unwrap();
    assert!(store.gateway_ownership().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_ownership_is_taken_over() {
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir);

    // A dead owner: the endpoint was bound once, nothing listens now.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    store.set_gateway_ownership(99999, &dead).await.unwrap();

    let running = start_running(test_config(&dir), store.clone()).await;
    assert_ne!(running.endpoint(), dead);

    let ownership = store.gateway_ownership().await.unwrap().unwrap();
    assert_eq!(ownership.endpoint, running.endpoint());
    assert_eq!(ownership.pid, std::process::id());

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ownership_not_cleared_by_non_owner_shutdown() {
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir);

    let running = start_running(test_config(&dir), store.clone()).await;

    // Another process re-recorded ownership while we were serving.
    store
        .set_gateway_ownership(424242, "127.0.0.1:9")
        .await
        .unwrap();

    running.shutdown().await.unwrap();

    // The newer record survives: shutdown only clears its own.
    let ownership = store.gateway_ownership().await.unwrap().unwrap();
    assert_eq!(ownership.pid, 424242);
}

#[tokio::test]
async fn test_no_free_port_in_window() {
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir);

    // Occupy a port and make it the whole search window.
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let config = Config {
        base_dir: Some(dir.path().to_path_buf()),
        port: taken,
        port_search_window: 1,
        ..Config::default()
    };

    let err = Gateway::with_store(config, store).start().await.unwrap_err();
    assert!(matches!(
        err,
        muster::GatewayError::NoFreePort { start, end } if start == taken && end == taken + 1
    ));
}

#[tokio::test]
async fn test_api_serves_instances_and_events() {
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir);

    store
        .register(100, "127.0.0.1:7001", Some("ide".to_string()), vec![])
        .await
        .unwrap();
    store
        .update_project(100, Some("my-app".to_string()), None)
        .await
        .unwrap();
    store.register(200, "127.0.0.1:7002", None, vec![]).await.unwrap();

    let running = start_running(test_config(&dir), store.clone()).await;
    let base = format!("http://{}", running.endpoint());
    let client = reqwest::Client::new();

    // Identity route carries the recognizable service tag.
    let health: serde_json::Value = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["service"], "muster-gateway");
    assert_eq!(health["status"], "ok");

    // Instance list includes labels and states.
    let instances: Vec<serde_json::Value> = client
        .get(format!("{base}/api/instances"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0]["label"], "100 - my-app");
    assert_eq!(instances[0]["state"], "live_with_project");
    assert_eq!(instances[1]["label"], "200 - NO PROJECT");

    // Single instance, and 404 on a miss.
    let one = client
        .get(format!("{base}/api/instances/100"))
        .send()
        .await
        .unwrap();
    assert_eq!(one.status(), 200);
    let missing = client
        .get(format!("{base}/api/instances/12345"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    // Event log in chronological order.
    let events: Vec<serde_json::Value> = client
        .get(format!("{base}/api/events?limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["started", "project_activated", "started"]);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_api_maps_proxy_errors_to_statuses() {
    let dir = TempDir::new().unwrap();
    let store = store_for(&dir);

    // A live record whose endpoint refuses connections.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    store.register(300, dead, None, vec![]).await.unwrap();

    let running = start_running(test_config(&dir), store.clone()).await;
    let base = format!("http://{}", running.endpoint());
    let client = reqwest::Client::new();

    // Force-kill on a live record is rejected with 409.
    let conflict = client
        .post(format!("{base}/api/instances/300/force-kill"))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);

    // A failed pass-through is 502 and flips the record to zombie.
    let unreachable = client
        .get(format!("{base}/api/instances/300/logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(unreachable.status(), 502);
    assert_eq!(store.get(300).await.unwrap().state, InstanceState::Zombie);

    // Now that it is a zombie, pass-throughs short-circuit with 502 too.
    let short_circuit = client
        .get(format!("{base}/api/instances/300/tool-stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(short_circuit.status(), 502);

    // And unknown pids are 404.
    let missing = client
        .get(format!("{base}/api/instances/9999/logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    running.shutdown().await.unwrap();
}
