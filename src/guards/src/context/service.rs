//! Cached permission snapshots per user

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{PermissionRegistry, PermissionSource};
use crate::cache::{CacheStats, LayeredCache};
use crate::clock::Clock;
use crate::config::ResolutionStrategy;
use crate::error::{AuthFailure, GuardError, Result};
use crate::types::{PermissionSnapshot, UserId};

/// Loads and caches [`PermissionSnapshot`]s.
///
/// A cached snapshot is served while it is live and still matches the
/// configured strategy and, under pre-expansion, the registry generation it
/// was expanded against. Anything else is reloaded from the source.
pub struct UserContextService {
    source: Arc<dyn PermissionSource>,
    cache: LayeredCache<PermissionSnapshot>,
    registry: Arc<PermissionRegistry>,
    strategy: ResolutionStrategy,
    ttl: Duration,
    check_staleness: bool,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
}

impl UserContextService {
    pub fn new(
        source: Arc<dyn PermissionSource>,
        cache: LayeredCache<PermissionSnapshot>,
        registry: Arc<PermissionRegistry>,
        strategy: ResolutionStrategy,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            cache,
            registry,
            strategy,
            ttl,
            check_staleness: false,
            clock,
            next_version: AtomicU64::new(1),
        }
    }

    /// Ask the source about staleness on every cache hit
    pub fn with_staleness_check(mut self, enabled: bool) -> Self {
        self.check_staleness = enabled;
        self
    }

    /// Cached snapshot, or a single-flight load from the source
    pub async fn load_context(&self, user_id: &str) -> Result<PermissionSnapshot> {
        let (snapshot, loaded) = self
            .cache
            .get_or_load_traced(user_id, self.ttl, || self.fetch(user_id))
            .await?;

        // Freshly loaded snapshots, including ones from a joined load, are
        // not questioned again
        if loaded || self.is_current(&snapshot).await? {
            return Ok(snapshot);
        }

        // Only the outdated snapshot is removed. Concurrent callers that saw
        // it too find it gone and join whichever reload is already running.
        debug!(user_id, version = snapshot.version, "Cached context outdated, reloading");
        self.cache
            .delete_if(user_id, |cached| {
                cached.version == snapshot.version && cached.loaded_at == snapshot.loaded_at
            })
            .await;
        self.cache
            .get_or_load(user_id, self.ttl, || self.fetch(user_id))
            .await
    }

    /// Drops the user's snapshot; true if one was cached locally
    pub async fn invalidate_user(&self, user_id: &str) -> bool {
        self.cache.delete(user_id).await
    }

    /// Drops every cached snapshot holding `role`; returns the affected users
    pub async fn invalidate_role(&self, role: &str) -> Vec<UserId> {
        let users = self.cache.delete_where(|snapshot| snapshot.has_role(role)).await;
        info!(role, users = users.len(), "Invalidated contexts by role");
        users
    }

    /// Drops every cached snapshot in every tier
    pub async fn invalidate_all_contexts(&self) -> usize {
        self.cache.delete_by_prefix("").await
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &Arc<PermissionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn cache(&self) -> &LayeredCache<PermissionSnapshot> {
        &self.cache
    }

    async fn fetch(&self, user_id: &str) -> Result<PermissionSnapshot> {
        let permissions = self
            .source
            .get_user_permissions(user_id)
            .await?
            .ok_or(GuardError::auth(AuthFailure::UnknownUser))?;

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let loaded_at = self.clock.now();

        let snapshot = match self.strategy {
            ResolutionStrategy::OnDemand => {
                PermissionSnapshot::on_demand(user_id, permissions, version, loaded_at)
            }
            ResolutionStrategy::PreExpansion => self.registry.with_known(|known, registry_version| {
                PermissionSnapshot::pre_expanded(
                    user_id,
                    permissions,
                    known,
                    registry_version,
                    version,
                    loaded_at,
                )
            }),
        };

        debug!(
            user_id,
            version,
            permissions = snapshot.permissions().len(),
            strategy = ?self.strategy,
            "Loaded user context"
        );

        Ok(snapshot)
    }

    async fn is_current(&self, snapshot: &PermissionSnapshot) -> Result<bool> {
        // Snapshots written by an instance with another strategy
        if snapshot.strategy() != self.strategy {
            return Ok(false);
        }

        if self.strategy == ResolutionStrategy::PreExpansion
            && snapshot.registry_version() != self.registry.version()
        {
            return Ok(false);
        }

        if self.check_staleness {
            let stale = self
                .source
                .is_context_stale(&snapshot.user_id, snapshot.loaded_at)
                .await?;
            return Ok(!stale);
        }

        Ok(true)
    }
}
