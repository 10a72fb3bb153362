// packages/engine/src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Logging goes through `tracing`; metrics go through the `metrics` facade
//! and are exported in Prometheus format. Without an installed recorder the
//! metric macros are no-ops, so library code records unconditionally.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const TASKS_SUBMITTED: &str = "conductor_tasks_submitted_total";
pub const TASKS_REJECTED: &str = "conductor_tasks_rejected_total";
pub const TASKS_FINISHED: &str = "conductor_tasks_finished_total";
pub const TASK_DURATION: &str = "conductor_task_duration_seconds";
pub const QUEUE_DEPTH: &str = "conductor_queue_depth";
pub const ACTIVE_WORKERS: &str = "conductor_active_workers";
pub const CACHE_EVICTIONS: &str = "conductor_cache_evictions_total";

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::Config(format!("invalid log level '{}': {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        "text" => registry.with(fmt::layer().with_target(true)).try_init(),
        other => {
            return Err(EngineError::Config(format!(
                "unknown log format '{}' (expected json or text)",
                other
            )))
        }
    };

    result.map_err(|e| EngineError::Config(format!("failed to install subscriber: {}", e)))
}

/// Install the Prometheus recorder and return a handle for rendering
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::Config(format!("failed to install metrics recorder: {}", e)))
}
