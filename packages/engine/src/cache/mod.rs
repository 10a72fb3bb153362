// packages/engine/src/cache/mod.rs
//! Bounded context cache
//!
//! - **Context Cache**: key → blob store with an item ceiling and a byte
//!   budget, evicting oldest entries first
//! - **Compressor**: zstd pass-through for values above a threshold
//!
//! # Eviction
//!
//! ```text
//! set(k, v) ──► bytes + |v| > budget ? ──► evict oldest until bytes + |v| ≤ budget/2
//!           └─► items > ceiling ?     ──► evict oldest until items ≤ ceiling
//! ```

pub mod compressor;
pub mod context_cache;

pub use compressor::{CompressionLevel, Compressor};
pub use context_cache::{agent_key, task_key, CacheStats, ContextCache};
