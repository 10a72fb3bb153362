// packages/engine/src/api/handlers.rs
//! Request handlers
//!
//! Handlers take already-read inputs and always produce a response; no
//! error escapes to the connection.

use crate::cache::CacheStats;
use crate::overlay::EvidenceOverlay;
use crate::registry::{AgentDescriptor, DescriptorStore, Registration};
use crate::runtime::{DispatchEngine, DispatchStats};
use crate::utils::errors::EngineError;
use crate::BuildInfo;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{
    HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use hyper::{Response, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub store: Option<DescriptorStore>,
    pub overlay: EvidenceOverlay,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<DispatchEngine>, overlay: EvidenceOverlay) -> Self {
        Self {
            engine,
            store: None,
            overlay,
            metrics: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_store(mut self, store: DescriptorStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Result of a registration call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_id: Option<String>,
}

impl RegisterResponse {
    fn ok(id: &str) -> Self {
        Self {
            success: true,
            error: None,
            registered_id: Some(id.to_string()),
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            registered_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    git_hash: &'static str,
    uptime_secs: u64,
    running: bool,
    agents: usize,
    dispatch: DispatchStats,
    cache: CacheStats,
}

pub type HttpResponse = Response<Full<Bytes>>;

pub fn text(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {}", e),
        ),
    }
}

pub fn not_found() -> HttpResponse {
    text(StatusCode::NOT_FOUND, "not found")
}

/// Headers sent on every response
pub fn with_security_headers(mut response: HttpResponse) -> HttpResponse {
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    response
}

/// `GET /healthz`
pub async fn healthz(state: &AppState) -> HttpResponse {
    if !state.engine.is_running() {
        return text(StatusCode::SERVICE_UNAVAILABLE, "dispatch engine stopped");
    }
    if let Some(store) = &state.store {
        if !store.ping().await {
            return text(StatusCode::SERVICE_UNAVAILABLE, "descriptor store unreachable");
        }
    }
    text(StatusCode::OK, "OK")
}

/// `GET /api/v1/status`
pub fn status(state: &AppState) -> HttpResponse {
    let build = BuildInfo::current();
    let body = StatusResponse {
        service: "conductor",
        version: build.version,
        git_hash: build.git_hash,
        uptime_secs: state.started_at.elapsed().as_secs(),
        running: state.engine.is_running(),
        agents: state.engine.registry().len(),
        dispatch: state.engine.stats(),
        cache: state.engine.cache().stats(),
    };
    json(StatusCode::OK, &body)
}

/// `GET /api/v1/cyborgs`
pub fn list_cyborgs(state: &AppState) -> HttpResponse {
    let agents = state.engine.registry().list();
    let agents: Vec<&AgentDescriptor> = agents.iter().map(|agent| &**agent).collect();
    json(StatusCode::OK, &agents)
}

/// `POST /api/v1/cyborgs`
///
/// The record is persisted before the registry is updated, so a descriptor
/// the dispatcher can select always survives a restart.
pub async fn register_cyborg(state: &AppState, body: &[u8]) -> HttpResponse {
    let descriptor: AgentDescriptor = match serde_json::from_slice(body) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            return json(
                StatusCode::BAD_REQUEST,
                &RegisterResponse::failed(format!("invalid descriptor document: {}", e)),
            )
        }
    };

    if let Err(e) = descriptor.validate() {
        return json(StatusCode::BAD_REQUEST, &RegisterResponse::failed(e));
    }

    if let Some(store) = &state.store {
        if let Err(e) = store.upsert(&descriptor).await {
            warn!(agent_id = %descriptor.id, "Failed to persist registration: {}", e);
            return json(StatusCode::INTERNAL_SERVER_ERROR, &RegisterResponse::failed(e));
        }
    }

    let id = descriptor.id.clone();
    match state.engine.registry().register(descriptor) {
        Ok(registration) => {
            info!(
                agent_id = %id,
                replaced = registration == Registration::Replaced,
                "Registered cyborg"
            );
            json(StatusCode::OK, &RegisterResponse::ok(&id))
        }
        Err(e) => json(StatusCode::BAD_REQUEST, &RegisterResponse::failed(e)),
    }
}

/// `DELETE /api/v1/cyborgs/{id}`
pub async fn deregister_cyborg(state: &AppState, id: &str) -> HttpResponse {
    if let Some(store) = &state.store {
        if let Err(e) = store.delete(id).await {
            warn!(agent_id = %id, "Failed to delete stored descriptor: {}", e);
            return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    match state.engine.registry().deregister(id) {
        Some(_) => {
            info!(agent_id = %id, "Deregistered cyborg");
            text(StatusCode::OK, "deregistered")
        }
        None => not_found(),
    }
}

/// `GET /api/v1/evidence`
pub fn list_evidence(state: &AppState) -> HttpResponse {
    match state.overlay.list() {
        Ok(ids) => json(StatusCode::OK, &ids),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /api/v1/evidence/{id}`
pub fn get_evidence(state: &AppState, agent_id: &str) -> HttpResponse {
    match state.overlay.snapshot(agent_id) {
        Ok(snapshot) => {
            let mut response = Response::new(Full::new(Bytes::copy_from_slice(&snapshot)));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(e @ EngineError::EvidenceNotFound { .. }) => text(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ EngineError::InvalidAgentId(_)) => text(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /metrics`
pub fn metrics(state: &AppState) -> HttpResponse {
    match &state.metrics {
        Some(handle) => text(StatusCode::OK, handle.render()),
        None => text(StatusCode::NOT_FOUND, "metrics recorder not installed"),
    }
}
