//! Permission source contract and an in-memory implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{GuardError, Result};
use crate::types::UserPermissions;

/// External owner of permission data
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// `Ok(None)` when the user is unknown
    async fn get_user_permissions(&self, user_id: &str) -> Result<Option<UserPermissions>>;

    /// Whether a snapshot loaded at `loaded_at` should be refreshed
    async fn is_context_stale(&self, _user_id: &str, _loaded_at: DateTime<Utc>) -> Result<bool> {
        Ok(false)
    }
}

/// In-memory permission source
pub struct InMemoryPermissionSource {
    users: Arc<RwLock<HashMap<String, UserPermissions>>>,
    stale: Arc<RwLock<HashSet<String>>>,
    latency: Option<Duration>,
    failing: AtomicBool,
    loads: AtomicU64,
}

impl InMemoryPermissionSource {
    /// Create a new empty source
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            stale: Arc::new(RwLock::new(HashSet::new())),
            latency: None,
            failing: AtomicBool::new(false),
            loads: AtomicU64::new(0),
        }
    }

    /// Delay every lookup, simulating a remote store
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store or replace a user's permissions
    pub async fn put_user(&self, user_id: impl Into<String>, permissions: UserPermissions) {
        self.users.write().await.insert(user_id.into(), permissions);
    }

    pub async fn remove_user(&self, user_id: &str) {
        self.users.write().await.remove(user_id);
    }

    /// Report the user's cached context as stale until the next lookup
    pub async fn mark_stale(&self, user_id: impl Into<String>) {
        self.stale.write().await.insert(user_id.into());
    }

    /// Make every lookup fail with a source error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of permission lookups served
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryPermissionSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionSource for InMemoryPermissionSource {
    async fn get_user_permissions(&self, user_id: &str) -> Result<Option<UserPermissions>> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(GuardError::Source("permission store unavailable".to_string()));
        }

        self.stale.write().await.remove(user_id);
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn is_context_stale(&self, user_id: &str, _loaded_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.stale.read().await.contains(user_id))
    }
}
