// packages/engine/tests/api.rs
//! HTTP surface over a real socket

use conductor_engine::api::{ApiServer, AppState, RegisterResponse};
use conductor_engine::registry::DescriptorStore;
use conductor_engine::utils::config::{CacheConfig, DispatchConfig};
use conductor_engine::{ContextCache, DispatchEngine, EvidenceOverlay, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Response {
    status: u16,
    head: String,
    body: String,
}

async fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> Response {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf).to_string();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let (head, body) = text
        .split_once("\r\n\r\n")
        .map(|(head, body)| (head.to_ascii_lowercase(), body.to_string()))
        .unwrap_or_default();
    Response { status, head, body }
}

async fn serve(evidence_root: &std::path::Path) -> (SocketAddr, Arc<DispatchEngine>, DescriptorStore, CancellationToken) {
    let engine = Arc::new(DispatchEngine::start(
        DispatchConfig::default(),
        Arc::new(Registry::new()),
        Arc::new(ContextCache::new(&CacheConfig::default())),
    ));
    let store = DescriptorStore::open_in_memory().await.unwrap();
    let state = AppState::new(
        Arc::clone(&engine),
        EvidenceOverlay::new(evidence_root, "merklelog.bin"),
    )
    .with_store(store.clone());

    let server = ApiServer::bind("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    (addr, engine, store, shutdown)
}

#[tokio::test]
async fn health_reflects_engine_state() {
    let dir = tempdir().unwrap();
    let (addr, engine, _store, shutdown) = serve(dir.path()).await;

    let response = request(addr, "GET", "/healthz", "").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "OK");
    assert!(response.head.contains("x-content-type-options: nosniff"));
    assert!(response.head.contains("x-frame-options: deny"));
    assert!(response.head.contains("x-xss-protection: 1; mode=block"));

    engine.shutdown().await;
    assert_eq!(request(addr, "GET", "/healthz", "").await.status, 503);
    shutdown.cancel();
}

#[tokio::test]
async fn registration_round_trip() {
    let dir = tempdir().unwrap();
    let (addr, engine, store, shutdown) = serve(dir.path()).await;

    let descriptor = r#"{"id":"ocr-1","capabilities":["ocr"],"deployment_ref":"k8s/ocr","tags":["vision"]}"#;
    let response = request(addr, "POST", "/api/v1/cyborgs", descriptor).await;
    assert_eq!(response.status, 200);
    let reply: RegisterResponse = serde_json::from_str(&response.body).unwrap();
    assert!(reply.success);
    assert_eq!(reply.registered_id.as_deref(), Some("ocr-1"));

    assert!(engine.registry().get("ocr-1").is_some());
    assert!(store.get("ocr-1").await.unwrap().is_some());

    let listed: serde_json::Value =
        serde_json::from_str(&request(addr, "GET", "/api/v1/cyborgs", "").await.body).unwrap();
    assert_eq!(listed[0]["tags"][0], "vision");

    let invalid = request(addr, "POST", "/api/v1/cyborgs", r#"{"id":"","capabilities":["x"],"deployment_ref":"d"}"#).await;
    assert_eq!(invalid.status, 400);
    let reply: RegisterResponse = serde_json::from_str(&invalid.body).unwrap();
    assert!(!reply.success);
    assert!(reply.error.is_some());

    assert_eq!(request(addr, "DELETE", "/api/v1/cyborgs/ocr-1", "").await.status, 200);
    assert!(engine.registry().is_empty());
    assert!(store.get("ocr-1").await.unwrap().is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn status_and_unknown_routes() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("ocr-1.merklelog.bin"), b"audit").unwrap();
    let (addr, _engine, _store, shutdown) = serve(dir.path()).await;

    let status: serde_json::Value =
        serde_json::from_str(&request(addr, "GET", "/api/v1/status", "").await.body).unwrap();
    assert_eq!(status["service"], "conductor");
    assert_eq!(status["running"], true);

    let evidence = request(addr, "GET", "/api/v1/evidence/ocr-1", "").await;
    assert_eq!(evidence.status, 200);
    assert_eq!(evidence.body, "audit");

    let missing = request(addr, "GET", "/nope", "").await;
    assert_eq!(missing.status, 404);
    assert!(missing.head.contains("x-frame-options: deny"));
    shutdown.cancel();
}
