// packages/engine/src/api/mod.rs
//! HTTP surface
//!
//! - **Server**: hyper http1 accept loop and request routing
//! - **Handlers**: health, status, registration, evidence and metrics
//!
//! # Routes
//!
//! ```text
//! GET    /healthz                 liveness of engine + store
//! GET    /api/v1/status           engine, queue, pool and cache stats
//! GET    /api/v1/cyborgs          registered descriptors
//! POST   /api/v1/cyborgs          register (upsert) a descriptor
//! DELETE /api/v1/cyborgs/{id}     deregister
//! GET    /api/v1/evidence         agent ids with evidence logs
//! GET    /api/v1/evidence/{id}    raw evidence bytes
//! GET    /metrics                 Prometheus exposition
//! ```

pub mod handlers;
pub mod server;

pub use handlers::{AppState, RegisterResponse};
pub use server::ApiServer;
