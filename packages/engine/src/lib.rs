// packages/engine/src/lib.rs
//! Conductor Dispatch Engine Library
//!
//! Routes tasks to registered worker agents ("cyborgs") by declared
//! capability and runs each task as an external process under a hard
//! deadline.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **registry**: Agent descriptors, the upsert registry, loading and persistence
//! - **cache**: Bounded context cache with byte-budget eviction
//! - **runtime**: Task queue, agent selection, worker pool, process execution
//! - **overlay**: Read-only evidence snapshots per agent
//! - **api**: HTTP health, status and registration endpoints
//! - **observability**: Tracing and metrics setup
//! - **utils**: Errors and configuration

// Public module exports
pub mod api;
pub mod cache;
pub mod observability;
pub mod overlay;
pub mod registry;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use cache::ContextCache;
pub use overlay::EvidenceOverlay;
pub use registry::{AgentDescriptor, Registry, ReliabilityTier};
pub use runtime::{DispatchEngine, TaskHandle, TaskResult, TaskSpec};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
