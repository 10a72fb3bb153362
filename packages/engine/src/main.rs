// packages/engine/src/main.rs
//! Conductor Dispatch Engine
//!
//! Loads configuration and agent descriptors, starts the dispatch engine
//! and serves the HTTP API until Ctrl-C.

use anyhow::{Context, Result};
use conductor_engine::api::{ApiServer, AppState};
use conductor_engine::observability::{init_metrics, init_tracing};
use conductor_engine::registry::DescriptorStore;
use conductor_engine::{
    ContextCache, DispatchEngine, EngineConfig, EvidenceOverlay, Registry, GIT_HASH, VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;

    // Initialize observability (tracing, metrics, logging)
    init_tracing(&config.logging)?;
    let metrics = init_metrics()?;

    info!("Starting Conductor dispatch engine v{} ({})", VERSION, GIT_HASH);
    debug!("Configuration loaded: {:?}", config);

    let store = match &config.registry.database_path {
        Some(path) => Some(
            DescriptorStore::open(path)
                .await
                .with_context(|| format!("failed to open descriptor store {}", path.display()))?,
        ),
        None => None,
    };

    // Descriptor files first, then runtime registrations persisted in the store
    let registry = Arc::new(Registry::new());
    if let Some(dir) = &config.registry.descriptor_dir {
        let loaded = registry.load_dir(dir)?;
        info!("Loaded {} descriptors from {}", loaded, dir.display());
    }
    if let Some(store) = &store {
        let stored = store.load_all().await?;
        info!("Restoring {} stored registrations", stored.len());
        for descriptor in stored {
            let id = descriptor.id.clone();
            if let Err(e) = registry.register(descriptor) {
                warn!(agent_id = %id, "Skipping stored descriptor: {}", e);
            }
        }
    }

    let cache = Arc::new(ContextCache::new(&config.cache));
    let engine = Arc::new(DispatchEngine::start(
        config.dispatch.clone(),
        Arc::clone(&registry),
        cache,
    ));

    let mut state = AppState::new(
        Arc::clone(&engine),
        EvidenceOverlay::from_config(&config.evidence),
    )
    .with_metrics(metrics);
    if let Some(store) = store {
        state = state.with_store(store);
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let server = ApiServer::bind(addr, state).await?;

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    // Graceful shutdown handler
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("Received shutdown signal, cleaning up...");

    shutdown.cancel();
    server_task.await.context("HTTP server task panicked")??;

    let report = engine.shutdown().await;
    info!(
        drained_queued = report.drained_queued,
        forced = report.forced,
        "Shutdown complete"
    );
    Ok(())
}
