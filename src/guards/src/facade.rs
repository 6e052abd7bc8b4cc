//! Guard facade: one configured instance, many reusable guards

use std::sync::Arc;
use tracing::info;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::cache::{CacheEpoch, LayeredCache, SharedCacheTier};
use crate::clock::{Clock, SystemClock};
use crate::config::{AuthHeaderConfig, GuardProfile};
use crate::context::{PermissionRegistry, PermissionSource, UserContextService};
use crate::error::Result;
use crate::guard::{AuthenticationGuard, GuardCore};
use crate::invalidation::{InvalidationCoordinator, InvalidationReport};
use crate::metrics::{GuardMetrics, HealthReport, MetricsCollector, SystemStats};
use crate::resolver::{PermissionExpression, PermissionSpec};
use crate::token::{CredentialExtractor, TokenVerifier, TokenVerifierAdapter};

/// Builder for [`RouteGuards`]
pub struct RouteGuardsBuilder {
    profile: GuardProfile,
    verifier: Arc<dyn TokenVerifier>,
    source: Arc<dyn PermissionSource>,
    auth_header: AuthHeaderConfig,
    shared: Option<Arc<dyn SharedCacheTier>>,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditSink>>,
    registry: Option<Arc<PermissionRegistry>>,
}

impl RouteGuardsBuilder {
    /// Credential header, `Authorization: Bearer` by default
    pub fn auth_header(mut self, config: AuthHeaderConfig) -> Self {
        self.auth_header = config;
        self
    }

    /// Second cache tier shared by every cache of the instance
    pub fn shared_tier(mut self, shared: Arc<dyn SharedCacheTier>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the default tracing sink; ignored when auditing is off
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Pre-populated permission catalogue
    pub fn registry(mut self, registry: Arc<PermissionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<RouteGuards> {
        self.profile.validate()?;

        let profile = self.profile;
        let settings = profile.cache;
        let epoch = CacheEpoch::new();
        let max_ttl = [
            settings.ttls.auth_token(),
            settings.ttls.user_context(),
            settings.ttls.permission_check(),
        ]
        .into_iter()
        .max()
        .unwrap_or_default();

        let token_cache = new_cache(namespace::TOKEN, &profile, max_ttl, &self.clock, &epoch, &self.shared);
        let context_cache = new_cache(namespace::CONTEXT, &profile, max_ttl, &self.clock, &epoch, &self.shared);
        let check_cache = new_cache(namespace::CHECK, &profile, max_ttl, &self.clock, &epoch, &self.shared);

        let registry = self.registry.unwrap_or_default();
        let tokens = Arc::new(TokenVerifierAdapter::new(
            self.verifier,
            token_cache,
            settings.ttls.auth_token(),
            Arc::clone(&self.clock),
        ));
        let contexts = Arc::new(
            UserContextService::new(
                self.source,
                context_cache,
                Arc::clone(&registry),
                profile.resolution_strategy,
                settings.ttls.user_context(),
                Arc::clone(&self.clock),
            )
            .with_staleness_check(profile.check_staleness),
        );
        let checks = Arc::new(check_cache);

        let audit = if profile.monitoring.audit {
            Some(
                self.audit
                    .unwrap_or_else(|| Arc::new(TracingAuditSink) as Arc<dyn AuditSink>),
            )
        } else {
            None
        };

        let metrics = Arc::new(MetricsCollector::new());
        let core = Arc::new(GuardCore {
            extractor: CredentialExtractor::new(self.auth_header),
            tokens: Arc::clone(&tokens),
            contexts: Arc::clone(&contexts),
            checks: Arc::clone(&checks),
            check_ttl: settings.ttls.permission_check(),
            metrics: Arc::clone(&metrics),
            audit: audit.clone(),
            request_timeout: profile.request_timeout(),
            detailed_logging: profile.monitoring.detailed_logging,
            performance_tracking: profile.monitoring.performance_tracking,
        });

        let invalidation = InvalidationCoordinator::new(
            Arc::clone(&tokens),
            Arc::clone(&contexts),
            Arc::clone(&checks),
            epoch.clone(),
            profile.invalidation_mode,
        )
        .with_shared_tier(self.shared.clone())
        .with_audit(audit);

        info!(
            environment = ?profile.environment,
            strategy = ?profile.resolution_strategy,
            invalidation = ?profile.invalidation_mode,
            cache_enabled = settings.enabled,
            shared_tier = self.shared.is_some(),
            "Route guards initialized"
        );

        Ok(RouteGuards {
            profile,
            core,
            tokens,
            contexts,
            checks,
            registry,
            metrics,
            invalidation,
            epoch,
        })
    }
}

/// Shared-tier key namespaces
mod namespace {
    pub const TOKEN: &str = "token";
    pub const CONTEXT: &str = "ctx";
    pub const CHECK: &str = "check";
}

fn new_cache<V>(
    namespace: &'static str,
    profile: &GuardProfile,
    max_ttl: std::time::Duration,
    clock: &Arc<dyn Clock>,
    epoch: &CacheEpoch,
    shared: &Option<Arc<dyn SharedCacheTier>>,
) -> LayeredCache<V>
where
    V: Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    let cache = LayeredCache::new(
        namespace,
        profile.cache.enabled,
        profile.cache.max_entries,
        max_ttl,
        Arc::clone(clock),
        epoch.clone(),
    );
    match shared {
        Some(shared) => cache.with_shared_tier(Arc::clone(shared)),
        None => cache,
    }
}

/// A configured guard instance.
///
/// Configure once at startup, then hand guards (or the instance itself,
/// behind an `Arc`) to every call site. Nothing here is process-global.
pub struct RouteGuards {
    profile: GuardProfile,
    core: Arc<GuardCore>,
    tokens: Arc<TokenVerifierAdapter>,
    contexts: Arc<UserContextService>,
    checks: Arc<LayeredCache<bool>>,
    registry: Arc<PermissionRegistry>,
    metrics: Arc<MetricsCollector>,
    invalidation: InvalidationCoordinator,
    epoch: CacheEpoch,
}

impl RouteGuards {
    pub fn builder(
        profile: GuardProfile,
        verifier: Arc<dyn TokenVerifier>,
        source: Arc<dyn PermissionSource>,
    ) -> RouteGuardsBuilder {
        RouteGuardsBuilder {
            profile,
            verifier,
            source,
            auth_header: AuthHeaderConfig::default(),
            shared: None,
            clock: Arc::new(SystemClock),
            audit: None,
            registry: None,
        }
    }

    /// Instance with the default header, clock and audit sink
    pub fn new(
        profile: GuardProfile,
        verifier: Arc<dyn TokenVerifier>,
        source: Arc<dyn PermissionSource>,
    ) -> Result<Self> {
        Self::builder(profile, verifier, source).build()
    }

    pub fn profile(&self) -> &GuardProfile {
        &self.profile
    }

    pub fn registry(&self) -> &Arc<PermissionRegistry> {
        &self.registry
    }

    /// Authentication only
    pub fn require_auth(&self) -> AuthenticationGuard {
        AuthenticationGuard::new(Arc::clone(&self.core), None)
    }

    /// Any one of the listed permissions
    pub fn require_permissions<I, S>(&self, permissions: I) -> Result<AuthenticationGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require(PermissionSpec::plain(permissions)?)
    }

    /// Any one of the listed patterns, e.g. `admin.*`
    pub fn require_wildcard_permissions<I, S>(&self, patterns: I) -> Result<AuthenticationGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require(PermissionSpec::wildcard(patterns)?)
    }

    /// A boolean expression, bounded by the profile's complexity limits
    pub fn require_complex_permissions(
        &self,
        expression: PermissionExpression,
    ) -> Result<AuthenticationGuard> {
        self.require(PermissionSpec::expression(expression, &self.profile.limits)?)
    }

    /// Guard for an already-built spec
    pub fn require(&self, spec: PermissionSpec) -> Result<AuthenticationGuard> {
        self.registry.register(spec.referenced_permissions())?;
        Ok(AuthenticationGuard::new(Arc::clone(&self.core), Some(spec)))
    }

    /// Guard counters
    pub async fn get_stats(&self) -> GuardMetrics {
        self.metrics.get_metrics().await
    }

    /// Counters plus per-cache statistics
    pub async fn get_system_stats(&self) -> SystemStats {
        SystemStats {
            metrics: self.metrics.get_metrics().await,
            token_cache: self.tokens.stats(),
            context_cache: self.contexts.stats(),
            check_cache: self.checks.stats(),
            registry_size: self.registry.len(),
            cache_epoch: self.epoch.current(),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport::from_stats(&self.get_system_stats().await)
    }

    /// Prometheus text exposition of the guard counters
    pub async fn export_prometheus(&self) -> String {
        self.metrics.export_prometheus().await
    }

    /// The user's permissions changed
    pub async fn invalidate_user_permissions(&self, user_id: &str, reason: &str) -> InvalidationReport {
        self.invalidation.invalidate_user(user_id, reason).await
    }

    /// A role's permissions changed
    pub async fn invalidate_role(&self, role: &str, reason: &str) -> InvalidationReport {
        self.invalidation.invalidate_role(role, reason).await
    }

    /// Drop everything cached, system-wide
    pub async fn emergency_invalidation(&self, reason: &str) -> InvalidationReport {
        self.invalidation.invalidate_all(reason).await
    }

    /// Revoke a credential
    pub async fn block_token(&self, raw: &str) {
        self.tokens.block(raw).await;
    }

    pub fn unblock_token(&self, raw: &str) -> bool {
        self.tokens.unblock(raw)
    }

    /// Physically removes dead entries; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.tokens.purge_expired() + self.contexts.cache().purge_expired() + self.checks.purge_expired()
    }
}
