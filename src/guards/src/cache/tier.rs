//! Second-tier cache backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::CacheDegradedError;

/// Shared cache tier (e.g. a cache server reachable by every instance).
///
/// Stores opaque bytes. Failures are reported, never panicked on: the
/// layered cache absorbs them and keeps serving from the first tier.
#[async_trait]
pub trait SharedCacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheDegradedError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheDegradedError>;

    async fn delete(&self, key: &str) -> Result<(), CacheDegradedError>;

    /// Returns the number of entries removed
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheDegradedError>;

    /// Single-call flush of the whole tier
    async fn clear(&self) -> Result<(), CacheDegradedError>;
}

/// In-process shared tier, one instance shared by several layered caches
pub struct InMemorySharedTier {
    entries: DashMap<String, (Vec<u8>, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemorySharedTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCacheTier for InMemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheDegradedError> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.1 => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, (_, expires_at)| now >= *expires_at);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheDegradedError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheDegradedError::Unavailable(format!("invalid ttl: {}", e)))?;
        let expires_at = self.clock.now() + ttl;
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheDegradedError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheDegradedError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn clear(&self) -> Result<(), CacheDegradedError> {
        self.entries.clear();
        Ok(())
    }
}
