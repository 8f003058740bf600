//! End-to-end tests for ConnectivityTracker.
//!
//! These run the tracker against the scripted bus endpoint and a local HTTP
//! server standing in for the connectivity-check page.

use md5::{Digest, Md5};
use pushconn_core::bus::testing::{TestingEndpoint, Work};
use pushconn_core::{BusValue, ConnectivityConfig, ConnectivityTracker, LinkState, RedialConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STATIC_TEXT: &str = "Hello Ubuntu!\n";

/// Serve `body` at `/check`.
async fn check_server(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

/// Write a config file pointing at `server` and load it back.
fn write_config(dir: &TempDir, server: &MockServer) -> ConnectivityConfig {
    let text = serde_json::json!({
        "connectivity_check_url": format!("{}/check", server.uri()),
        "connectivity_check_md5": hex::encode(Md5::digest(STATIC_TEXT.as_bytes())),
        "recheck_timeout": "10m",
        "stabilizing_timeout": "10ms",
        "webcheck_timeout": "2s",
    });
    let file = dir.path().join("config.json");
    std::fs::write(&file, text.to_string()).expect("Failed to write config");
    ConnectivityConfig::from_file(&file).expect("Failed to load config")
}

fn endpoint(retvals: Vec<BusValue>) -> Arc<TestingEndpoint> {
    Arc::new(TestingEndpoint::new(Work(true), Work(true), retvals))
}

fn redial() -> RedialConfig {
    RedialConfig {
        restart_cooldown: Duration::from_millis(10),
        ..RedialConfig::immediate()
    }
}

async fn next(rx: &mut mpsc::Receiver<bool>) -> bool {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a verdict")
        .expect("tracker hung up")
}

#[tokio::test]
async fn test_run_follows_link_state() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let server = check_server(STATIC_TEXT).await;
    let config = write_config(&dir, &server);

    let primary = BusValue::ObjectPath("/org/freedesktop/NetworkManager/ActiveConnection/1".into());
    let endp = endpoint(vec![
        LinkState::Disconnected.into(),
        primary.clone(),
        LinkState::Disconnected.into(),
        primary,
    ]);
    let state = endp.watch_source("StateChanged");
    let _props = endp.watch_source("PropertiesChanged");

    let tracker = Arc::new(
        ConnectivityTracker::new(endp.clone(), config)
            .unwrap()
            .with_redial_config(redial()),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.track(tx).await }
    });

    // Baseline first, then the webcheck confirms the new link.
    assert!(!next(&mut rx).await);
    state.send(vec![LinkState::ConnectedGlobal.into()]).await.unwrap();
    assert!(next(&mut rx).await);

    state.send(vec![LinkState::Disconnected.into()]).await.unwrap();
    assert!(!next(&mut rx).await);

    // Killing the subscription restarts tracking, which re-sends the baseline.
    drop(state);
    assert!(!next(&mut rx).await);
    assert!(endp.call_args().iter().any(|c| c.member == "::Close"));

    tracker.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("track should stop after cancel")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_starting_connected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let server = check_server(STATIC_TEXT).await;
    let config = write_config(&dir, &server);

    let endp = endpoint(vec![LinkState::ConnectedGlobal.into(), BusValue::ObjectPath("/".into())]);
    let _state = endp.watch_source("StateChanged");
    let _props = endp.watch_source("PropertiesChanged");

    let tracker = Arc::new(
        ConnectivityTracker::new(endp, config)
            .unwrap()
            .with_redial_config(redial()),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.track(tx).await }
    });

    assert!(!next(&mut rx).await);
    assert!(next(&mut rx).await);

    tracker.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_captive_portal_stays_offline() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let portal = check_server("<html>Sign in to continue</html>").await;
    let config = write_config(&dir, &portal);

    let endp = endpoint(vec![LinkState::ConnectedGlobal.into(), BusValue::ObjectPath("/".into())]);
    let _state = endp.watch_source("StateChanged");
    let _props = endp.watch_source("PropertiesChanged");

    let tracker = Arc::new(
        ConnectivityTracker::new(endp, config)
            .unwrap()
            .with_redial_config(redial()),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.track(tx).await }
    });

    assert!(!next(&mut rx).await);
    let more = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(more.is_err(), "a portal page must not count as online");

    tracker.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_primary_connection_change_rechecks() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let server = check_server(STATIC_TEXT).await;
    let config = write_config(&dir, &server);

    let endp = endpoint(vec![
        LinkState::ConnectedGlobal.into(),
        BusValue::ObjectPath("/wifi".into()),
    ]);
    let _state = endp.watch_source("StateChanged");
    let props = endp.watch_source("PropertiesChanged");

    let tracker = Arc::new(
        ConnectivityTracker::new(endp, config)
            .unwrap()
            .with_redial_config(redial()),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.track(tx).await }
    });

    assert!(!next(&mut rx).await);
    assert!(next(&mut rx).await);

    let changed = std::collections::HashMap::from([(
        "PrimaryConnection".to_string(),
        BusValue::ObjectPath("/ethernet".into()),
    )]);
    props.send(vec![BusValue::Dict(changed), BusValue::Array(vec![])]).await.unwrap();
    assert!(!next(&mut rx).await);
    assert!(next(&mut rx).await);

    tracker.cancel();
    task.await.unwrap().unwrap();
}
