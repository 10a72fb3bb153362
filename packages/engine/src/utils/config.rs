// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered as defaults, then an optional file, then environment variables
//! of the form `CONDUCTOR_<SECTION>__<KEY>` (for example
//! `CONDUCTOR_DISPATCH__MAX_WORKERS=32`).

use crate::utils::errors::{EngineError, Result};
use ::config::{Config, Environment, File, FileFormat, FileSourceFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "CONDUCTOR_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "CONDUCTOR";

/// Upper bound for every millisecond setting (one week)
pub const MAX_DURATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub cache: CacheConfig,
    pub registry: RegistryConfig,
    pub evidence: EvidenceConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener for health, status and registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Queue, worker pool and deadline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fixed capacity of the task queue (default: 1000)
    pub queue_capacity: usize,

    /// Worker-pool cap `W` (default: 10)
    pub max_workers: usize,

    /// Idle workers kept for reuse (default: 10)
    pub max_idle_workers: usize,

    /// Default per-task deadline in milliseconds (default: 60s)
    pub task_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL when terminating a process
    pub kill_grace_ms: u64,

    /// How long shutdown waits for in-flight tasks before cancelling them
    pub drain_timeout_ms: u64,

    /// Store each completed task's stdout in the context cache
    pub cache_task_output: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            max_workers: 10,
            max_idle_workers: 10,
            task_timeout_ms: 60_000,
            kill_grace_ms: 2_000,
            drain_timeout_ms: 30_000,
            cache_task_output: false,
        }
    }
}

impl DispatchConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Context cache governors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries (default: 1000)
    pub max_items: usize,

    /// Aggregate byte budget (default: 100MB)
    pub max_bytes: usize,

    /// Compress values larger than `compression_threshold`
    pub compression_enabled: bool,

    /// Size in bytes above which values are compressed (default: 4KB)
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_bytes: 100 * 1024 * 1024,
            compression_enabled: true,
            compression_threshold: 4 * 1024,
        }
    }
}

/// Where agent descriptors come from and are persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory of descriptor records loaded at startup
    pub descriptor_dir: Option<PathBuf>,

    /// SQLite database for registered descriptors
    pub database_path: Option<PathBuf>,
}

/// Read-only evidence snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub root: PathBuf,
    pub extension: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("evidence"),
            extension: "merklelog.bin".to_string(),
        }
    }
}

/// Log output settings; `RUST_LOG` takes precedence over `level`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,

    /// json or text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `CONDUCTOR_CONFIG` (or `conductor.*` if present) and the environment
    pub fn load() -> Result<Self> {
        let file = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => File::from(PathBuf::from(path)).required(true),
            _ => File::with_name("conductor").required(false),
        };
        Self::build(Some(file), Self::environment())
    }

    /// Load from an explicit file with no environment overlay
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let file = File::from(path.into()).required(true);
        Self::build(Some(file), Self::environment().source(Some(Default::default())))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn build(file: Option<File<FileSourceFile, FileFormat>>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config: EngineConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let dispatch = &self.dispatch;
        if dispatch.queue_capacity == 0 {
            return Err(EngineError::Config("dispatch.queue_capacity must be > 0".into()));
        }
        if dispatch.max_workers == 0 {
            return Err(EngineError::Config("dispatch.max_workers must be > 0".into()));
        }
        if dispatch.max_idle_workers > dispatch.max_workers {
            return Err(EngineError::Config(format!(
                "dispatch.max_idle_workers ({}) exceeds dispatch.max_workers ({})",
                dispatch.max_idle_workers, dispatch.max_workers
            )));
        }
        if dispatch.task_timeout_ms == 0 {
            return Err(EngineError::Config("dispatch.task_timeout_ms must be > 0".into()));
        }
        for (name, value) in [
            ("task_timeout_ms", dispatch.task_timeout_ms),
            ("kill_grace_ms", dispatch.kill_grace_ms),
            ("drain_timeout_ms", dispatch.drain_timeout_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(EngineError::Config(format!(
                    "dispatch.{} ({}) exceeds {}",
                    name, value, MAX_DURATION_MS
                )));
            }
        }
        if self.cache.max_items == 0 || self.cache.max_bytes == 0 {
            return Err(EngineError::Config(
                "cache.max_items and cache.max_bytes must be > 0".into(),
            ));
        }
        if self.evidence.extension.trim_matches('.').is_empty() {
            return Err(EngineError::Config("evidence.extension must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.queue_capacity, 1000);
        assert_eq!(config.dispatch.task_timeout(), Duration::from_secs(60));
        assert_eq!(config.evidence.extension, "merklelog.bin");
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor.yaml");
        std::fs::write(
            &path,
            "dispatch:\n  queue_capacity: 4\n  max_workers: 2\n  max_idle_workers: 1\ncache:\n  compression_enabled: false\n",
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.dispatch.queue_capacity, 4);
        assert_eq!(config.dispatch.max_workers, 2);
        assert!(!config.cache.compression_enabled);
        // untouched sections keep their defaults
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_environment_overrides() {
        let mut vars = HashMap::new();
        vars.insert("CONDUCTOR_DISPATCH__MAX_WORKERS".to_string(), "3".to_string());
        vars.insert("CONDUCTOR_SERVER__PORT".to_string(), "9191".to_string());

        let env = EngineConfig::environment().source(Some(vars));
        let config = EngineConfig::build(None, env).unwrap();
        assert_eq!(config.dispatch.max_workers, 3);
        assert_eq!(config.server.port, 9191);
    }

    #[test]
    fn test_validation_rejects_idle_above_cap() {
        let mut config = EngineConfig::default();
        config.dispatch.max_workers = 2;
        config.dispatch.max_idle_workers = 5;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.dispatch.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_huge_timeouts() {
        let mut vars = HashMap::new();
        vars.insert(
            "CONDUCTOR_DISPATCH__TASK_TIMEOUT_MS".to_string(),
            u64::MAX.to_string(),
        );
        let env = EngineConfig::environment().source(Some(vars));
        assert!(matches!(
            EngineConfig::build(None, env),
            Err(EngineError::Config(_))
        ));

        let mut config = EngineConfig::default();
        config.dispatch.kill_grace_ms = MAX_DURATION_MS + 1;
        assert!(config.validate().is_err());

        config.dispatch.kill_grace_ms = MAX_DURATION_MS;
        assert!(config.validate().is_ok());
    }
}
