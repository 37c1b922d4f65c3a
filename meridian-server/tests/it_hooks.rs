//! Geofence hook delivery tests with a live webhook sink.

mod support;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::TestServer;
use tempfile::tempdir;
use tokio::sync::mpsc;

struct Sink {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<serde_json::Value>,
    accept: Arc<AtomicBool>,
}

/// A webhook sink that refuses with 503 until `accept` flips, then
/// collects event payloads.
async fn start_sink() -> Sink {
    let (tx, events) = mpsc::unbounded_channel();
    let accept = Arc::new(AtomicBool::new(true));
    let accept_flag = accept.clone();
    let app = Router::new().route(
        "/geo",
        post(move |body: String| {
            let tx = tx.clone();
            let accept = accept_flag.clone();
            async move {
                if !accept.load(Ordering::Relaxed) {
                    return StatusCode::SERVICE_UNAVAILABLE;
                }
                if let Ok(v) = body.parse::<serde_json::Value>() {
                    let _ = tx.send(v);
                }
                StatusCode::OK
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Sink {
        addr,
        events,
        accept,
    }
}

async fn next_event(sink: &mut Sink) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(10), sink.events.recv())
        .await
        .expect("timed out waiting for webhook event")
        .expect("sink channel closed")
}

#[tokio::test]
async fn entering_a_fence_delivers_enter_then_inside() {
    let dir = tempdir().unwrap();
    let mut sink = start_sink().await;
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    let endpoint = format!("http://{}/geo", sink.addr);
    assert_eq!(
        c.cmd(&[
            "SETHOOK", "warehouse", &endpoint, "NEARBY", "fleet", "FENCE", "POINT", "33.5",
            "-115.5", "1000",
        ])
        .await
        .expect_int(),
        1
    );

    c.cmd(&["SET", "fleet", "bus1", "POINT", "33.5", "-115.5"])
        .await;

    let event = next_event(&mut sink).await;
    assert_eq!(event["detect"], "enter");
    assert_eq!(event["hook"], "warehouse");
    assert_eq!(event["key"], "fleet");
    assert_eq!(event["id"], "bus1");
    assert_eq!(event["command"], "set");
    assert_eq!(event["object"]["type"], "Point");

    let event = next_event(&mut sink).await;
    assert_eq!(event["detect"], "inside");

    // Leaving the fence produces a single exit.
    c.cmd(&["SET", "fleet", "bus1", "POINT", "34.5", "-114.0"])
        .await;
    let event = next_event(&mut sink).await;
    assert_eq!(event["detect"], "exit");

    server.stop().await;
}

#[tokio::test]
async fn detect_mask_limits_delivered_kinds() {
    let dir = tempdir().unwrap();
    let mut sink = start_sink().await;
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    let endpoint = format!("http://{}/geo", sink.addr);
    c.cmd(&[
        "SETHOOK", "h", &endpoint, "WITHIN", "fleet", "DETECT", "enter,exit", "FENCE",
        "BOUNDS", "33", "-116", "34", "-115",
    ])
    .await;

    // Two mutations inside the fence: only the first (enter) is delivered.
    c.cmd(&["SET", "fleet", "bus1", "POINT", "33.5", "-115.5"]).await;
    c.cmd(&["SET", "fleet", "bus1", "POINT", "33.6", "-115.5"]).await;
    c.cmd(&["SET", "fleet", "bus1", "POINT", "40.0", "-100.0"]).await;

    let event = next_event(&mut sink).await;
    assert_eq!(event["detect"], "enter");
    let event = next_event(&mut sink).await;
    assert_eq!(event["detect"], "exit");

    server.stop().await;
}

#[tokio::test]
async fn delivery_retries_until_endpoint_recovers() {
    let dir = tempdir().unwrap();
    let mut sink = start_sink().await;
    sink.accept.store(false, Ordering::Relaxed);

    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    let endpoint = format!("http://{}/geo", sink.addr);
    c.cmd(&[
        "SETHOOK", "h", &endpoint, "NEARBY", "fleet", "FENCE", "POINT", "33.5", "-115.5",
        "1000",
    ])
    .await;
    c.cmd(&["SET", "fleet", "bus1", "POINT", "33.5", "-115.5"])
        .await;

    // The endpoint is down; the event stays queued and the hook reports
    // itself active.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let hooks = c.cmd(&["HOOKS", "*"]).await;
    let hook = hooks.expect_array()[0].expect_array();
    let pending = hook.last().unwrap().expect_int();
    assert!(pending >= 1, "expected pending events, got {pending}");

    // Once the endpoint recovers, the retry loop drains the queue.
    sink.accept.store(true, Ordering::Relaxed);
    let event = next_event(&mut sink).await;
    assert_eq!(event["detect"], "enter");

    server.stop().await;
}
