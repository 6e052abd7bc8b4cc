//! Layered TTL cache with single-flight population

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{CacheEntry, CacheEpoch, CacheStats, SharedCacheTier};
use crate::clock::Clock;
use crate::error::{CacheDegradedError, Result};

/// How long the second tier is bypassed after a failed read or write
const SHARED_TIER_BACKOFF: Duration = Duration::from_secs(5);

/// Second-tier wire format
#[derive(Serialize, Deserialize)]
struct Envelope<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

type InFlight<V> = Arc<OnceCell<Result<V>>>;

/// Two-tier TTL cache.
///
/// Every operation is safe under concurrent access; there is no
/// cache-wide lock. Reads never return an entry once it has expired or once
/// the shared [`CacheEpoch`] has moved past it.
pub struct LayeredCache<V> {
    /// Prefix applied to keys in the shared tier
    namespace: &'static str,

    /// First tier
    memory: DashMap<String, CacheEntry<V>>,

    /// Optional second tier
    shared: Option<Arc<dyn SharedCacheTier>>,

    /// Loads currently running, one per key
    in_flight: DashMap<String, InFlight<V>>,

    clock: Arc<dyn Clock>,
    epoch: CacheEpoch,
    enabled: bool,
    max_entries: usize,

    /// Longest TTL this cache hands out
    max_ttl: Duration,

    /// Shared tier is skipped until this instant (unix millis)
    shared_suspended_until: AtomicI64,

    next_stamp: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
    evictions: AtomicU64,
}

impl<V> LayeredCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        namespace: &'static str,
        enabled: bool,
        max_entries: usize,
        max_ttl: Duration,
        clock: Arc<dyn Clock>,
        epoch: CacheEpoch,
    ) -> Self {
        Self {
            namespace,
            memory: DashMap::new(),
            shared: None,
            in_flight: DashMap::new(),
            clock,
            epoch,
            enabled,
            max_entries: max_entries.max(1),
            max_ttl,
            shared_suspended_until: AtomicI64::new(i64::MIN),
            next_stamp: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Attaches a second tier
    pub fn with_shared_tier(mut self, shared: Arc<dyn SharedCacheTier>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    /// First-tier presence, live or not
    pub fn contains_key(&self, key: &str) -> bool {
        self.memory.contains_key(key)
    }

    /// Returns a live value, consulting the second tier on a first-tier miss
    pub async fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }

        let now = self.clock.now();
        let epoch = self.epoch.current();

        let stale = match self.memory.get(key) {
            Some(entry) if entry.is_live(now, epoch) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if stale {
            self.memory
                .remove_if(key, |_, entry| !entry.is_live(now, epoch));
        }

        if let Some((value, expires_at)) = self.get_shared(key, now).await {
            let stamp = self.next_stamp();
            self.insert_memory(key, value.clone(), expires_at, epoch, stamp);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores a value for `ttl`. A zero TTL stores nothing.
    pub async fn set(&self, key: &str, value: V, ttl: Duration) {
        let epoch = self.epoch.current();
        let stamp = self.next_stamp();
        self.store(key, value, ttl, epoch, stamp).await;
    }

    /// Removes one key from every tier and abandons any in-flight load of it
    pub async fn delete(&self, key: &str) -> bool {
        self.in_flight.remove(key);
        let removed = self.memory.remove(key).is_some();

        if let Some(shared) = self.shared_tier_for_write() {
            let full_key = self.shared_key(key);
            if let Err(e) = shared.delete(&full_key).await {
                self.shared_invalidation_failed(&e);
            }
        }

        removed
    }

    /// Removes `key` only while its first-tier value still matches
    /// `predicate`. Loads in flight for the key are left running, so
    /// callers replacing an outdated value converge on a single reload.
    pub async fn delete_if<F>(&self, key: &str, predicate: F) -> bool
    where
        F: Fn(&V) -> bool,
    {
        let matches = self
            .memory
            .get(key)
            .map_or(false, |entry| predicate(&entry.value));
        if !matches {
            return false;
        }

        // Second tier first, so nobody reads the old value back from it
        // once the first-tier entry is gone
        if let Some(shared) = self.shared_tier_for_write() {
            if let Err(e) = shared.delete(&self.shared_key(key)).await {
                self.shared_invalidation_failed(&e);
            }
        }

        self.memory
            .remove_if(key, |_, entry| predicate(&entry.value))
            .is_some()
    }

    /// Removes every key starting with `prefix`
    pub async fn delete_by_prefix(&self, prefix: &str) -> usize {
        self.in_flight.retain(|key, _| !key.starts_with(prefix));

        let before = self.memory.len();
        self.memory.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.memory.len());

        if let Some(shared) = self.shared_tier_for_write() {
            let full_prefix = self.shared_key(prefix);
            if let Err(e) = shared.delete_by_prefix(&full_prefix).await {
                self.shared_invalidation_failed(&e);
            }
        }

        removed
    }

    /// Removes first-tier entries whose value matches `predicate`, and the
    /// same keys from the second tier. Returns the keys removed.
    pub async fn delete_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&V) -> bool,
    {
        let mut removed = Vec::new();
        self.memory.retain(|key, entry| {
            if predicate(&entry.value) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });

        for key in &removed {
            self.in_flight.remove(key);
        }

        if let Some(shared) = self.shared_tier_for_write() {
            for key in &removed {
                if let Err(e) = shared.delete(&self.shared_key(key)).await {
                    self.shared_invalidation_failed(&e);
                    break;
                }
            }
        }

        removed
    }

    /// Stops reading the second tier after an invalidation it missed
    pub fn bypass_shared_tier(&self, error: &CacheDegradedError) {
        if self.shared.is_some() {
            self.shared_invalidation_failed(error);
        }
    }

    /// Drops pending loads so nobody joins a load started before an epoch bump
    pub fn abandon_in_flight(&self) {
        self.in_flight.clear();
    }

    /// Physically removes expired and superseded entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let epoch = self.epoch.current();
        let before = self.memory.len();
        self.memory.retain(|_, entry| entry.is_live(now, epoch));
        before.saturating_sub(self.memory.len())
    }

    /// Returns the cached value or runs `loader` exactly once per key across
    /// concurrent callers; every waiter receives the same result.
    ///
    /// A load invalidated while running still answers its waiters but is not
    /// left in the cache.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.get_or_load_with_ttl(key, move |_| ttl, loader).await
    }

    /// Like [`get_or_load`](Self::get_or_load), with the TTL derived from the
    /// loaded value
    pub async fn get_or_load_with_ttl<T, F, Fut>(&self, key: &str, ttl_for: T, loader: F) -> Result<V>
    where
        T: FnOnce(&V) -> Duration,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.load_traced(key, ttl_for, loader)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`get_or_load`](Self::get_or_load), also reporting whether the
    /// value was produced by a load during this call (this caller's or one
    /// it joined) rather than served from a tier
    pub async fn get_or_load_traced<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<(V, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.load_traced(key, move |_| ttl, loader).await
    }

    async fn load_traced<T, F, Fut>(&self, key: &str, ttl_for: T, loader: F) -> Result<(V, bool)>
    where
        T: FnOnce(&V) -> Duration,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok((value, false));
        }

        let cell = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let epoch = self.epoch.current();

        let result = cell
            .get_or_init(|| async {
                // An earlier load may have finished between the miss above
                // and this cell being created
                if let Some(value) = self.get_live(key) {
                    return Ok(value);
                }

                debug!(cache = self.namespace, key, "Loading cache entry");
                let loaded = loader().await;

                if let Ok(value) = &loaded {
                    let ttl = ttl_for(value);
                    let stamp = self.next_stamp();
                    self.store(key, value.clone(), ttl, epoch, stamp).await;

                    // Invalidated while loading: take back what was stored
                    if !self.is_current_load(key, &cell) {
                        self.memory.remove_if(key, |_, entry| entry.stamp == stamp);
                        if let Some(shared) = self.shared_tier_for_write() {
                            if let Err(e) = shared.delete(&self.shared_key(key)).await {
                                self.shared_invalidation_failed(&e);
                            }
                        }
                        debug!(cache = self.namespace, key, "Discarded load invalidated in flight");
                    }
                }

                loaded
            })
            .await
            .clone();

        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, &cell));

        result.map(|value| (value, true))
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.memory.len(),
        }
    }

    /// Entries physically held in the first tier, live or not
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// First-tier capacity
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Number of loads currently running
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    // Private helpers

    fn next_stamp(&self) -> u64 {
        self.next_stamp.fetch_add(1, Ordering::Relaxed)
    }

    fn get_live(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let now = self.clock.now();
        let epoch = self.epoch.current();
        self.memory
            .get(key)
            .filter(|entry| entry.is_live(now, epoch))
            .map(|entry| entry.value.clone())
    }

    fn is_current_load(&self, key: &str, cell: &InFlight<V>) -> bool {
        self.in_flight
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current.value(), cell))
    }

    async fn store(&self, key: &str, value: V, ttl: Duration, epoch: u64, stamp: u64) {
        if !self.enabled || ttl.is_zero() {
            return;
        }

        let ttl = ttl.min(self.max_ttl);
        let Ok(chrono_ttl) = chrono::Duration::from_std(ttl) else {
            return;
        };
        let expires_at = self.clock.now() + chrono_ttl;

        if let Some(shared) = self.shared_tier_for_read() {
            match serde_json::to_vec(&Envelope {
                value: &value,
                expires_at,
            }) {
                Ok(bytes) => {
                    if let Err(e) = shared.set(&self.shared_key(key), bytes, ttl).await {
                        self.shared_failed(&e);
                    }
                }
                Err(e) => self.shared_failed(&CacheDegradedError::from(e)),
            }
        }

        self.insert_memory(key, value, expires_at, epoch, stamp);
    }

    fn insert_memory(&self, key: &str, value: V, expires_at: DateTime<Utc>, epoch: u64, stamp: u64) {
        if self.memory.len() >= self.max_entries && !self.memory.contains_key(key) {
            self.evict();
        }

        self.memory.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at,
                created_version: epoch,
                stamp,
            },
        );
    }

    /// Drops dead entries, then an arbitrary tenth if still full
    fn evict(&self) {
        let purged = self.purge_expired();
        let mut evicted = purged;

        if self.memory.len() >= self.max_entries {
            let to_remove = (self.max_entries / 10).max(1);
            let mut removed = 0;
            self.memory.retain(|_, _| {
                if removed < to_remove {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            evicted += removed;
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    async fn get_shared(&self, key: &str, now: DateTime<Utc>) -> Option<(V, DateTime<Utc>)> {
        let shared = self.shared_tier_for_read()?;

        match shared.get(&self.shared_key(key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Envelope<V>>(&bytes) {
                Ok(envelope) if now < envelope.expires_at => {
                    Some((envelope.value, envelope.expires_at))
                }
                Ok(_) => None,
                Err(e) => {
                    self.shared_failed(&CacheDegradedError::from(e));
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.shared_failed(&e);
                None
            }
        }
    }

    fn shared_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn shared_tier_for_read(&self) -> Option<&Arc<dyn SharedCacheTier>> {
        let shared = self.shared.as_ref()?;
        let suspended_until = self.shared_suspended_until.load(Ordering::Acquire);
        if self.clock.now().timestamp_millis() < suspended_until {
            return None;
        }
        Some(shared)
    }

    /// Invalidations are always attempted, even while reads are suspended
    fn shared_tier_for_write(&self) -> Option<&Arc<dyn SharedCacheTier>> {
        if !self.enabled {
            return None;
        }
        self.shared.as_ref()
    }

    fn shared_failed(&self, error: &CacheDegradedError) {
        self.suspend_shared_tier(SHARED_TIER_BACKOFF);
        warn!(cache = self.namespace, %error, "Shared cache tier degraded, using local tier only");
    }

    /// A missed invalidation may leave stale entries behind for up to the
    /// longest TTL, so reads stay off the tier for that long.
    fn shared_invalidation_failed(&self, error: &CacheDegradedError) {
        self.suspend_shared_tier(self.max_ttl.max(SHARED_TIER_BACKOFF));
        warn!(cache = self.namespace, %error, "Shared cache tier invalidation failed, bypassing tier");
    }

    fn suspend_shared_tier(&self, duration: Duration) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        let until = self.clock.now().timestamp_millis()
            + i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 2);
        self.shared_suspended_until.fetch_max(until, Ordering::AcqRel);
    }
}
