// packages/engine/src/utils/errors.rs
//! Error taxonomy for the dispatch engine
//!
//! Every rejected or failed task terminates its result handle with one of
//! these variants. The engine never retries on its own; callers can use
//! [`EngineError::is_retryable`] to decide whether a retry makes sense.

use std::path::PathBuf;
use std::time::Duration;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the dispatch engine and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Descriptor failed validation at registration
    #[error("invalid descriptor '{id}': {reason}")]
    InvalidDescriptor { id: String, reason: String },

    /// A descriptor file could not be read, parsed or registered
    #[error("failed to load descriptor from {}: {reason}", path.display())]
    DescriptorLoad { path: PathBuf, reason: String },

    /// Admission-time backpressure: the task queue is at capacity
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No registered agent covers the required capabilities
    #[error("no agent available with capabilities [{}]", capabilities.join(", "))]
    NoAgentAvailable { capabilities: Vec<String> },

    /// Execution exceeded its deadline; the process was terminated
    #[error("task timed out after {after:?}")]
    Timeout { after: Duration },

    /// The engine could not start or observe the process
    #[error("execution of '{command}' failed: {reason}")]
    ExecutionFailed { command: String, reason: String },

    /// The caller stopped waiting or cancelled the task
    #[error("task was cancelled")]
    Cancelled,

    /// The engine is shutting down and no longer accepts or runs work
    #[error("dispatch engine is shutting down")]
    ShuttingDown,

    /// A cache value is larger than the entire byte budget
    #[error("cache value for '{key}' is {size} bytes, budget is {max} bytes")]
    CacheValueTooLarge { key: String, size: usize, max: usize },

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("storage failed: {0}")]
    StorageFailed(String),

    /// No evidence file exists for the agent
    #[error("evidence not found for agent '{agent_id}'")]
    EvidenceNotFound { agent_id: String },

    #[error("invalid agent id '{0}'")]
    InvalidAgentId(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The HTTP surface could not bind or accept
    #[error("server error: {0}")]
    Server(String),
}

impl EngineError {
    /// Whether a caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::QueueFull { .. }
                | EngineError::NoAgentAvailable { .. }
                | EngineError::Timeout { .. }
        )
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidDescriptor { .. } => "invalid_descriptor",
            EngineError::DescriptorLoad { .. } => "descriptor_load",
            EngineError::QueueFull { .. } => "queue_full",
            EngineError::NoAgentAvailable { .. } => "no_agent_available",
            EngineError::Timeout { .. } => "timeout",
            EngineError::ExecutionFailed { .. } => "execution_failed",
            EngineError::Cancelled => "cancelled",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::CacheValueTooLarge { .. } => "cache_value_too_large",
            EngineError::CompressionFailed(_) => "compression_failed",
            EngineError::StorageFailed(_) => "storage_failed",
            EngineError::EvidenceNotFound { .. } => "evidence_not_found",
            EngineError::InvalidAgentId(_) => "invalid_agent_id",
            EngineError::Config(_) => "config",
            EngineError::Server(_) => "server",
        }
    }
}

impl From<::config::ConfigError> for EngineError {
    fn from(err: ::config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StorageFailed(err.to_string())
    }
}
