//! Cache invalidation across every tier
//!
//! Conservative mode (the default) over-clears: invalidating a user drops
//! the user's context, every cached permission check and every cached
//! credential verification. Permissive mode drops the context alone and
//! lets the other entries age out within their TTL.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditSink, InvalidationScope};
use crate::cache::{CacheEpoch, LayeredCache, SharedCacheTier};
use crate::config::InvalidationMode;
use crate::context::UserContextService;
use crate::guard::user_check_prefix;
use crate::token::TokenVerifierAdapter;

/// Outcome of one invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub scope: InvalidationScope,
    /// Local first-tier entries dropped or logically invalidated
    pub entries_removed: usize,
    pub mode: InvalidationMode,
}

pub struct InvalidationCoordinator {
    tokens: Arc<TokenVerifierAdapter>,
    contexts: Arc<UserContextService>,
    checks: Arc<LayeredCache<bool>>,
    epoch: CacheEpoch,
    shared: Option<Arc<dyn SharedCacheTier>>,
    mode: InvalidationMode,
    audit: Option<Arc<dyn AuditSink>>,
}

impl InvalidationCoordinator {
    pub(crate) fn new(
        tokens: Arc<TokenVerifierAdapter>,
        contexts: Arc<UserContextService>,
        checks: Arc<LayeredCache<bool>>,
        epoch: CacheEpoch,
        mode: InvalidationMode,
    ) -> Self {
        Self {
            tokens,
            contexts,
            checks,
            epoch,
            shared: None,
            mode,
            audit: None,
        }
    }

    pub(crate) fn with_shared_tier(mut self, shared: Option<Arc<dyn SharedCacheTier>>) -> Self {
        self.shared = shared;
        self
    }

    pub(crate) fn with_audit(mut self, audit: Option<Arc<dyn AuditSink>>) -> Self {
        self.audit = audit;
        self
    }

    pub fn mode(&self) -> InvalidationMode {
        self.mode
    }

    /// Invalidate what is cached for one user
    pub async fn invalidate_user(&self, user_id: &str, reason: &str) -> InvalidationReport {
        // Context first: a check computed after this point reloads it
        let mut removed = usize::from(self.contexts.invalidate_user(user_id).await);

        if self.mode == InvalidationMode::Conservative {
            removed += self.checks.delete_by_prefix(&user_check_prefix(user_id)).await;
            removed += self.tokens.invalidate_user(user_id).await;
        }

        self.report(InvalidationScope::User(user_id.to_string()), removed, reason)
            .await
    }

    /// Invalidate every user whose cached snapshot holds `role`
    pub async fn invalidate_role(&self, role: &str, reason: &str) -> InvalidationReport {
        let users = self.contexts.invalidate_role(role).await;
        let mut removed = users.len();

        if self.mode == InvalidationMode::Conservative {
            for user_id in &users {
                removed += self.checks.delete_by_prefix(&user_check_prefix(user_id)).await;
            }

            // Snapshots held only by the second tier cannot be found by role
            if self.contexts.cache().has_shared_tier() {
                removed += self.contexts.invalidate_all_contexts().await;
                removed += self.checks.delete_by_prefix("").await;
            }
        }

        self.report(InvalidationScope::Role(role.to_string()), removed, reason)
            .await
    }

    /// Emergency flush of every cache. Constant work regardless of how
    /// many entries are cached.
    pub async fn invalidate_all(&self, reason: &str) -> InvalidationReport {
        let removed = self.tokens.cache().len() + self.contexts.cache().len() + self.checks.len();

        self.epoch.advance();
        self.tokens.cache().abandon_in_flight();
        self.contexts.cache().abandon_in_flight();
        self.checks.abandon_in_flight();
        self.tokens.clear_user_index();

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.clear().await {
                warn!(error = %e, "Shared tier flush failed, bypassing it");
                self.tokens.cache().bypass_shared_tier(&e);
                self.contexts.cache().bypass_shared_tier(&e);
                self.checks.bypass_shared_tier(&e);
            }
        }

        self.report(InvalidationScope::All, removed, reason).await
    }

    async fn report(&self, scope: InvalidationScope, entries_removed: usize, reason: &str) -> InvalidationReport {
        info!(
            scope = %scope,
            entries_removed,
            mode = ?self.mode,
            reason,
            "Cache invalidated"
        );

        if let Some(audit) = &self.audit {
            audit
                .record(AuditEvent::invalidated(scope.clone(), reason))
                .await;
        }

        InvalidationReport {
            scope,
            entries_removed,
            mode: self.mode,
        }
    }
}
