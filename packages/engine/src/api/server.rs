// packages/engine/src/api/server.rs
//! HTTP server
//!
//! One hyper http1 connection task per accepted socket; routing is a plain
//! match on method and path.

use super::handlers::{self, AppState, HttpResponse};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Largest request body accepted (registration documents are small)
const MAX_BODY_BYTES: usize = 1024 * 1024;

const CYBORGS_PREFIX: &str = "/api/v1/cyborgs/";
const EVIDENCE_PREFIX: &str = "/api/v1/evidence/";

pub struct ApiServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Bind the listener; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EngineError::Server(format!("Failed to bind {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| EngineError::Server(format!("Failed to read local address: {}", e)))
    }

    /// Accept connections until `shutdown` fires
    ///
    /// Connections already accepted run to completion on their own tasks.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!("HTTP API listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", addr);

                        let io = TokioIo::new(stream);

                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, Infallible>(route(&state, req).await) }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("HTTP API stopped accepting connections");
        Ok(())
    }
}

/// Dispatch a request to its handler
pub async fn route(state: &AppState, req: Request<Incoming>) -> HttpResponse {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/healthz") => handlers::healthz(state).await,
        ("GET", "/api/v1/status") => handlers::status(state),
        ("GET", "/api/v1/cyborgs") => handlers::list_cyborgs(state),
        ("POST", "/api/v1/cyborgs") => match read_body(req).await {
            Ok(body) => handlers::register_cyborg(state, &body).await,
            Err(response) => response,
        },
        ("GET", "/api/v1/evidence") => handlers::list_evidence(state),
        ("GET", "/metrics") => handlers::metrics(state),
        ("DELETE", p) => match path_param(p, CYBORGS_PREFIX) {
            Some(id) => handlers::deregister_cyborg(state, id).await,
            None => handlers::not_found(),
        },
        ("GET", p) => match path_param(p, EVIDENCE_PREFIX) {
            Some(id) => handlers::get_evidence(state, id),
            None => handlers::not_found(),
        },
        _ => handlers::not_found(),
    };
    handlers::with_security_headers(response)
}

/// The single path segment following `prefix`
fn path_param<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

async fn read_body(req: Request<Incoming>) -> std::result::Result<Bytes, HttpResponse> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(handlers::text(
            StatusCode::BAD_REQUEST,
            format!("failed to read request body: {}", e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_param() {
        assert_eq!(path_param("/api/v1/cyborgs/ocr-1", CYBORGS_PREFIX), Some("ocr-1"));
        assert_eq!(path_param("/api/v1/cyborgs/", CYBORGS_PREFIX), None);
        assert_eq!(path_param("/api/v1/cyborgs/a/b", CYBORGS_PREFIX), None);
        assert_eq!(path_param("/api/v1/status", CYBORGS_PREFIX), None);
    }
}
