// packages/engine/src/cache/context_cache.rs
//! Bounded key → blob cache for per-agent and per-task context
//!
//! Entries are ordered by insertion; overwriting a key moves it to the
//! newest position, reads do not reorder. The aggregate byte count is kept
//! as running state and adjusted on every mutation.

use crate::cache::compressor::Compressor;
use crate::observability::CACHE_EVICTIONS;
use crate::utils::config::CacheConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Cache key for context owned by an agent
pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// Cache key for context produced by a task
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

struct Entry {
    seq: u64,
    data: Bytes,
    compressed: bool,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Insertion sequence → key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    current_bytes: usize,
    max_bytes: usize,
    compression_enabled: bool,
    evictions: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.current_bytes -= entry.data.len();
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.current_bytes -= entry.data.len();
        }
        self.evictions += 1;
        metrics::counter!(CACHE_EVICTIONS).increment(1);
        trace!(key = %key, "Evicted cache entry");
        Some(key)
    }

    /// Evict oldest entries until `incoming` more bytes fit within half the budget
    fn shrink_for(&mut self, incoming: usize) {
        let target = self.max_bytes / 2;
        let mut evicted = 0usize;
        while self.current_bytes + incoming > target && self.evict_oldest().is_some() {
            evicted += 1;
        }
        debug!(
            evicted,
            current_bytes = self.current_bytes,
            max_bytes = self.max_bytes,
            "Byte budget exceeded, trimmed cache"
        );
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub item_count: usize,
    pub max_items: usize,
    pub max_bytes: usize,
    pub current_bytes: usize,
    pub compression_enabled: bool,
    pub evictions: u64,
}

/// Bounded context cache
pub struct ContextCache {
    inner: RwLock<CacheInner>,
    max_items: usize,
    compression_threshold: usize,
    compressor: Compressor,
}

impl ContextCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                current_bytes: 0,
                max_bytes: config.max_bytes,
                compression_enabled: config.compression_enabled,
                evictions: 0,
            }),
            max_items: config.max_items.max(1),
            compression_threshold: config.compression_threshold,
            compressor: Compressor::default(),
        }
    }

    /// Store `value` under `key`, evicting the oldest entries as needed
    ///
    /// With compression disabled the stored bytes are exactly `value`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        let value = value.into();

        let compression_enabled = self.inner.read().compression_enabled;
        let (data, compressed) = if compression_enabled && value.len() > self.compression_threshold {
            let packed = self.compressor.compress(&value)?;
            if packed.len() < value.len() {
                (Bytes::from(packed), true)
            } else {
                (value, false)
            }
        } else {
            (value, false)
        };
        let size = data.len();

        let mut inner = self.inner.write();
        if size > inner.max_bytes {
            return Err(EngineError::CacheValueTooLarge {
                key,
                size,
                max: inner.max_bytes,
            });
        }

        inner.remove(&key);
        if inner.current_bytes + size > inner.max_bytes {
            inner.shrink_for(size);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.current_bytes += size;
        inner.entries.insert(key, Entry { seq, data, compressed });

        // the new entry holds the highest sequence, so it is never the one evicted here
        while inner.entries.len() > self.max_items {
            inner.evict_oldest();
        }
        Ok(())
    }

    /// Fetch a value, transparently decompressing it
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let (data, compressed) = {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                Some(entry) => (entry.data.clone(), entry.compressed),
                None => return Ok(None),
            }
        };

        if compressed {
            Ok(Some(Bytes::from(self.compressor.decompress(&data)?)))
        } else {
            Ok(Some(data))
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
        inner.current_bytes = 0;
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True once the item ceiling is reached
    pub fn is_full(&self) -> bool {
        self.inner.read().entries.len() >= self.max_items
    }

    pub fn evict_oldest(&self) -> Option<String> {
        self.inner.write().evict_oldest()
    }

    pub fn set_compression(&self, enabled: bool) {
        self.inner.write().compression_enabled = enabled;
    }

    /// Change the byte budget, trimming immediately if it is now exceeded
    pub fn set_max_bytes(&self, max_bytes: usize) {
        let mut inner = self.inner.write();
        inner.max_bytes = max_bytes;
        if inner.current_bytes > max_bytes {
            inner.shrink_for(0);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            item_count: inner.entries.len(),
            max_items: self.max_items,
            max_bytes: inner.max_bytes,
            current_bytes: inner.current_bytes,
            compression_enabled: inner.compression_enabled,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cache(max_items: usize, max_bytes: usize, compression: bool) -> ContextCache {
        ContextCache::new(&CacheConfig {
            max_items,
            max_bytes,
            compression_enabled: compression,
            compression_threshold: 64,
        })
    }

    #[test]
    fn test_uncompressed_roundtrip_is_identical() {
        let cache = cache(10, 10_000, false);
        let value = b"x".repeat(1_000);
        cache.set("k", value.clone()).unwrap();

        assert_eq!(cache.get("k").unwrap().unwrap().as_ref(), value.as_slice());
        assert_eq!(cache.stats().current_bytes, 1_000);
        assert!(cache.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_compressed_values_are_transparent() {
        let cache = cache(10, 100_000, true);
        let value = b"repetitive evidence ".repeat(500);
        cache.set(agent_key("ocr"), value.clone()).unwrap();

        let stats = cache.stats();
        assert!(stats.compression_enabled);
        assert!(stats.current_bytes < value.len());
        assert_eq!(cache.get(&agent_key("ocr")).unwrap().unwrap().as_ref(), value.as_slice());
    }

    #[test]
    fn test_small_values_skip_compression() {
        let cache = cache(10, 10_000, true);
        cache.set("small", &b"tiny"[..]).unwrap();
        assert_eq!(cache.stats().current_bytes, 4);
    }

    #[test]
    fn test_byte_budget_evicts_oldest_down_to_half() {
        let cache = cache(100, 1_000, false);
        for i in 0..10 {
            cache.set(format!("k{}", i), vec![0u8; 100]).unwrap();
        }
        assert_eq!(cache.stats().current_bytes, 1_000);

        cache.set("k10", vec![0u8; 100]).unwrap();

        let stats = cache.stats();
        assert!(stats.current_bytes <= 500);
        assert_eq!(stats.current_bytes, 500);
        for i in 0..6 {
            assert!(!cache.contains(&format!("k{}", i)), "k{} should be evicted", i);
        }
        for i in 6..=10 {
            assert!(cache.contains(&format!("k{}", i)), "k{} should remain", i);
        }
        assert_eq!(stats.evictions, 6);
    }

    #[test]
    fn test_item_ceiling() {
        let cache = cache(3, 10_000, false);
        for key in ["a", "b", "c"] {
            cache.set(key, &b"v"[..]).unwrap();
        }
        assert!(cache.is_full());

        cache.set("d", &b"v"[..]).unwrap();
        assert_eq!(cache.size(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_overwrite_refreshes_position_and_size() {
        let cache = cache(2, 10_000, false);
        cache.set("a", vec![1u8; 10]).unwrap();
        cache.set("b", vec![1u8; 10]).unwrap();
        cache.set("a", vec![2u8; 30]).unwrap();
        assert_eq!(cache.stats().current_bytes, 40);

        cache.set("c", vec![3u8; 5]).unwrap();
        assert!(!cache.contains("b"));
        assert!(cache.contains("a"));
        assert_eq!(cache.stats().current_bytes, 35);
    }

    #[test]
    fn test_value_larger_than_budget_rejected() {
        let cache = cache(10, 100, false);
        cache.set("keep", vec![0u8; 10]).unwrap();
        let result = cache.set(task_key("t1"), vec![0u8; 101]);
        assert!(matches!(result, Err(EngineError::CacheValueTooLarge { .. })));
        assert!(cache.contains("keep"));
    }

    #[test]
    fn test_delete_clear_and_manual_eviction() {
        let cache = cache(10, 1_000, false);
        cache.set("a", vec![0u8; 10]).unwrap();
        cache.set("b", vec![0u8; 20]).unwrap();

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.stats().current_bytes, 20);

        assert_eq!(cache.evict_oldest(), Some("b".to_string()));
        assert_eq!(cache.evict_oldest(), None);

        cache.set("c", vec![0u8; 5]).unwrap();
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[test]
    fn test_shrinking_budget_trims() {
        let cache = cache(10, 1_000, false);
        for i in 0..5 {
            cache.set(format!("k{}", i), vec![0u8; 100]).unwrap();
        }
        cache.set_max_bytes(300);
        let stats = cache.stats();
        assert_eq!(stats.max_bytes, 300);
        assert!(stats.current_bytes <= 150);
        assert!(cache.contains("k4"));
    }

    proptest! {
        #[test]
        fn prop_running_total_matches_contents(
            ops in proptest::collection::vec((0u8..8, 0usize..300, any::<bool>()), 1..60)
        ) {
            let cache = cache(6, 1_000, false);
            for (key, len, delete) in ops {
                let key = format!("k{}", key);
                if delete {
                    cache.delete(&key);
                    continue;
                }

                let existing = cache.get(&key).unwrap().map(|v| v.len()).unwrap_or(0);
                let before = cache.stats().current_bytes - existing;
                cache.set(key.clone(), vec![7u8; len]).unwrap();
                let after = cache.stats().current_bytes;

                prop_assert!(after <= 1_000);
                prop_assert!(cache.contains(&key));
                if before + len > 1_000 {
                    prop_assert!(after <= 500.max(len));
                }
            }

            let mut total = 0;
            for i in 0..8u8 {
                if let Some(value) = cache.get(&format!("k{}", i)).unwrap() {
                    total += value.len();
                }
            }
            prop_assert_eq!(total, cache.stats().current_bytes);
        }
    }
}
