//! Credential extraction and cached token verification

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, LayeredCache};
use crate::clock::Clock;
use crate::config::AuthHeaderConfig;
use crate::error::{AuthFailure, GuardError, Result};
use crate::guard::GuardRequest;
use crate::types::{Principal, UserId};

/// Caller-supplied credential verification
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Rejections are `GuardError::Authentication`; verifier crashes are
    /// `GuardError::Source`
    async fn verify_token(&self, raw: &str) -> Result<Principal>;
}

/// Adapts an async closure into a [`TokenVerifier`]
pub struct FnVerifier<F>(F);

impl<F> FnVerifier<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TokenVerifier for FnVerifier<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Principal>> + Send,
{
    async fn verify_token(&self, raw: &str) -> Result<Principal> {
        (self.0)(raw.to_string()).await
    }
}

/// Pulls the raw credential out of a request
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    config: AuthHeaderConfig,
}

impl CredentialExtractor {
    pub fn new(config: AuthHeaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AuthHeaderConfig {
        &self.config
    }

    pub fn extract<'a, R>(&self, request: &'a R) -> Result<&'a str>
    where
        R: GuardRequest + ?Sized,
    {
        let value = request
            .header(&self.config.header_name)
            .ok_or(GuardError::auth(AuthFailure::MissingCredential))?
            .trim();

        let credential = match &self.config.prefix {
            Some(prefix) => {
                let scheme = value
                    .get(..prefix.len())
                    .filter(|scheme| scheme.eq_ignore_ascii_case(prefix))
                    .ok_or(GuardError::auth(AuthFailure::MalformedCredential))?;
                &value[scheme.len()..]
            }
            None => value,
        };

        let credential = credential.trim();
        if credential.is_empty() {
            return Err(GuardError::auth(AuthFailure::MalformedCredential));
        }

        Ok(credential)
    }
}

/// Hex digest under which a credential is cached; the raw value never is
pub fn fingerprint(raw: &str) -> String {
    blake3::hash(raw.as_bytes()).to_hex().to_string()
}

/// Wraps a [`TokenVerifier`] with caching and revocation
pub struct TokenVerifierAdapter {
    verifier: Arc<dyn TokenVerifier>,
    cache: LayeredCache<Principal>,
    ttl: Duration,
    clock: Arc<dyn Clock>,

    /// Fingerprints of revoked credentials
    blocklist: DashSet<String>,

    /// Fingerprints cached per user, for per-user invalidation
    user_tokens: DashMap<UserId, HashSet<String>>,
}

impl TokenVerifierAdapter {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        cache: LayeredCache<Principal>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier,
            cache,
            ttl,
            clock,
            blocklist: DashSet::new(),
            user_tokens: DashMap::new(),
        }
    }

    /// Verify a raw credential, serving repeat credentials from cache
    pub async fn verify(&self, raw: &str) -> Result<Principal> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GuardError::auth(AuthFailure::MalformedCredential));
        }

        let fp = fingerprint(raw);
        if self.blocklist.contains(&fp) {
            warn!(fingerprint = %&fp[..12], "Blocked credential presented");
            return Err(GuardError::auth(AuthFailure::BlockedCredential));
        }

        let clock = Arc::clone(&self.clock);
        let max_ttl = self.ttl;
        let principal = self
            .cache
            .get_or_load_with_ttl(
                &fp,
                move |principal: &Principal| ttl_until_expiry(principal, max_ttl, clock.as_ref()),
                || self.verifier.verify_token(raw),
            )
            .await?;

        if principal.is_expired(self.clock.now()) {
            self.cache.delete(&fp).await;
            return Err(GuardError::auth(AuthFailure::ExpiredCredential));
        }

        // Revoked while the verification was running
        if self.blocklist.contains(&fp) {
            self.cache.delete(&fp).await;
            return Err(GuardError::auth(AuthFailure::BlockedCredential));
        }

        if self.cache.is_enabled() {
            self.index_credential(&principal.id, fp);
        }

        Ok(principal)
    }

    /// Revoke a credential; takes priority over any cached verification
    pub async fn block(&self, raw: &str) {
        let fp = fingerprint(raw.trim());
        self.cache.delete(&fp).await;
        self.blocklist.insert(fp);
        info!("Credential blocked");
    }

    pub fn unblock(&self, raw: &str) -> bool {
        self.blocklist.remove(&fingerprint(raw.trim())).is_some()
    }

    pub fn is_blocked(&self, raw: &str) -> bool {
        self.blocklist.contains(&fingerprint(raw.trim()))
    }

    /// Drops every cached verification mapping to `user_id`
    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        let Some((_, fingerprints)) = self.user_tokens.remove(user_id) else {
            return 0;
        };

        let mut removed = 0;
        for fp in &fingerprints {
            if self.cache.delete(fp).await {
                removed += 1;
            }
        }

        debug!(user_id, removed, "Invalidated cached credentials");
        removed
    }

    /// Physically drops dead entries and prunes the user index
    pub fn purge_expired(&self) -> usize {
        let purged = self.cache.purge_expired();
        self.prune_user_index();
        purged
    }

    /// Fingerprints currently tracked across all users
    pub fn indexed_credentials(&self) -> usize {
        self.user_tokens.iter().map(|entry| entry.value().len()).sum()
    }

    /// Records `fp` under its user. The index never tracks more than the
    /// first tier holds: fingerprints evicted from the cache are dropped
    /// whenever their user gains a new one, and users whose fingerprints are
    /// all gone are swept once the index outgrows the cache.
    fn index_credential(&self, user_id: &str, fp: String) {
        {
            let mut fingerprints = self.user_tokens.entry(user_id.to_string()).or_default();
            if !fingerprints.contains(&fp) {
                fingerprints.retain(|known| self.cache.contains_key(known));
                fingerprints.insert(fp);
            }
        }

        if self.user_tokens.len() > 2 * self.cache.capacity() {
            self.prune_user_index();
        }
    }

    fn prune_user_index(&self) {
        self.user_tokens.retain(|_, fingerprints| {
            fingerprints.retain(|fp| self.cache.contains_key(fp));
            !fingerprints.is_empty()
        });
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn cache(&self) -> &LayeredCache<Principal> {
        &self.cache
    }

    pub(crate) fn clear_user_index(&self) {
        self.user_tokens.clear();
    }
}

/// Cache no longer than the profile TTL or the principal's own expiry
fn ttl_until_expiry(principal: &Principal, max_ttl: Duration, clock: &dyn Clock) -> Duration {
    match principal.expires_at {
        Some(expires_at) => (expires_at - clock.now())
            .to_std()
            .map(|remaining| remaining.min(max_ttl))
            .unwrap_or(Duration::ZERO),
        None => max_ttl,
    }
}
