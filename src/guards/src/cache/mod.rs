//! Multi-tier TTL cache
//!
//! Generic key/value caching with no knowledge of authorization:
//!
//! - First tier: in-process `DashMap` (lock-free sharded access)
//! - Optional second tier: any [`SharedCacheTier`], read-through on miss
//! - TTL expiry checked on every read, physical eviction is lazy
//! - A global [`CacheEpoch`] invalidates every entry in O(1)
//! - Single-flight population through [`LayeredCache::get_or_load`]

mod layered;
mod tier;


pub use layered::LayeredCache;
pub use tier::{InMemorySharedTier, SharedCacheTier};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cached value with expiry and the epoch it was loaded under
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: DateTime<Utc>,
    pub created_version: u64,
    stamp: u64,
}

impl<V> CacheEntry<V> {
    /// Never live once `now >= expires_at` or once the epoch moved past it
    pub fn is_live(&self, now: DateTime<Utc>, epoch: u64) -> bool {
        now < self.expires_at && self.created_version >= epoch
    }
}

/// Global invalidation counter shared by every cache of a guard instance
#[derive(Debug, Clone, Default)]
pub struct CacheEpoch(Arc<AtomicU64>);

impl CacheEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidates every entry created before the call
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Second-tier failures absorbed by falling back
    pub degraded: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Sums counters across caches
    pub fn merge(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            degraded: self.degraded + other.degraded,
            evictions: self.evictions + other.evictions,
            entries: self.entries + other.entries,
        }
    }
}
