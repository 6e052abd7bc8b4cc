//! Authentication guard pipeline
//!
//! ```text
//! START → VERIFYING → (VERIFIED | AUTH_FAILED)
//!       → LOADING_CONTEXT → (CONTEXT_LOADED | CONTEXT_FAILED)
//!       → [EVALUATING_PERMISSIONS → (ALLOWED | DENIED)] → END
//! ```
//!
//! Every failed or denied state is terminal and fails closed. A
//! cancellation or the profile's request timeout aborts the pipeline with
//! [`GuardError::Timeout`].

pub mod request;

pub use request::GuardRequest;

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::cache::LayeredCache;
use crate::context::UserContextService;
use crate::error::{GuardError, Result};
use crate::metrics::MetricsCollector;
use crate::resolver::{self, PermissionSpec};
use crate::token::{CredentialExtractor, TokenVerifierAdapter};
use crate::types::{PermissionSnapshot, Principal, UserId};

/// Separates the user id from the rest of a permission-check cache key
const CHECK_KEY_SEPARATOR: char = '\u{1f}';

/// Prefix shared by every permission-check entry of one user
pub(crate) fn user_check_prefix(user_id: &str) -> String {
    format!("{}{}", user_id, CHECK_KEY_SEPARATOR)
}

/// Check results are tied to the snapshot they were computed from
fn check_key(snapshot: &PermissionSnapshot, spec_fingerprint: &str) -> String {
    format!(
        "{}{:x}.{:x}{}{}",
        user_check_prefix(&snapshot.user_id),
        snapshot.version,
        snapshot.loaded_at.timestamp_micros(),
        CHECK_KEY_SEPARATOR,
        spec_fingerprint
    )
}

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStage {
    Start,
    Verifying,
    Verified,
    AuthFailed,
    LoadingContext,
    ContextLoaded,
    ContextFailed,
    EvaluatingPermissions,
    Allowed,
    Denied,
    End,
}

/// What a passing guard attaches to the request
#[derive(Debug, Clone)]
pub struct AuthorizedRequest {
    pub principal: Principal,
    pub context: PermissionSnapshot,
}

/// State shared by every guard built from one instance
pub(crate) struct GuardCore {
    pub(crate) extractor: CredentialExtractor,
    pub(crate) tokens: Arc<TokenVerifierAdapter>,
    pub(crate) contexts: Arc<UserContextService>,
    pub(crate) checks: Arc<LayeredCache<bool>>,
    pub(crate) check_ttl: Duration,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) audit: Option<Arc<dyn AuditSink>>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) detailed_logging: bool,
    pub(crate) performance_tracking: bool,
}

struct Requirement {
    spec: PermissionSpec,
    fingerprint: String,
}

/// A reusable guard: authentication plus an optional permission requirement.
///
/// Cheap to clone; holds no per-request state.
#[derive(Clone)]
pub struct AuthenticationGuard {
    core: Arc<GuardCore>,
    requirement: Option<Arc<Requirement>>,
}

impl AuthenticationGuard {
    pub(crate) fn new(core: Arc<GuardCore>, spec: Option<PermissionSpec>) -> Self {
        let requirement = spec.map(|spec| {
            let fingerprint = spec.fingerprint();
            Arc::new(Requirement { spec, fingerprint })
        });
        Self { core, requirement }
    }

    /// The permission requirement, `None` for authentication only
    pub fn requirement(&self) -> Option<&PermissionSpec> {
        self.requirement.as_ref().map(|r| &r.spec)
    }

    /// Run the guard against a request
    pub fn check<R>(&self, request: &R) -> BoxFuture<'_, Result<AuthorizedRequest>>
    where
        R: GuardRequest + ?Sized,
    {
        self.check_with_cancel(request, CancellationToken::new())
    }

    /// Run the guard, aborting with [`GuardError::Timeout`] once `cancel` fires
    pub fn check_with_cancel<R>(
        &self,
        request: &R,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AuthorizedRequest>>
    where
        R: GuardRequest + ?Sized,
    {
        let credential = self.core.extractor.extract(request).map(str::to_owned);
        self.authorize(credential, cancel).boxed()
    }

    /// Run the guard against a credential already taken off the request
    pub async fn check_credential(&self, raw: &str) -> Result<AuthorizedRequest> {
        self.authorize(Ok(raw.to_owned()), CancellationToken::new())
            .await
    }

    async fn authorize(
        &self,
        credential: Result<String>,
        cancel: CancellationToken,
    ) -> Result<AuthorizedRequest> {
        let started = Instant::now();
        let mut user_id = None;
        self.stage(GuardStage::Start, None);

        let outcome = {
            let pipeline = self.run_bounded(credential, &mut user_id);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(GuardError::Timeout),
                result = pipeline => result,
            }
        };

        self.finish(&outcome, user_id, started).await;
        outcome.map_err(|e| e.redacted())
    }

    async fn run_bounded(
        &self,
        credential: Result<String>,
        user_id: &mut Option<UserId>,
    ) -> Result<AuthorizedRequest> {
        let pipeline = self.run(credential, user_id);
        match self.core.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, pipeline).await {
                Ok(result) => result,
                Err(_) => Err(GuardError::Timeout),
            },
            None => pipeline.await,
        }
    }

    async fn run(
        &self,
        credential: Result<String>,
        user_id: &mut Option<UserId>,
    ) -> Result<AuthorizedRequest> {
        self.stage(GuardStage::Verifying, None);
        let verified = match credential {
            Ok(raw) => self.core.tokens.verify(&raw).await,
            Err(e) => Err(e),
        };
        let principal = match verified {
            Ok(principal) => principal,
            Err(e) => {
                self.stage(GuardStage::AuthFailed, None);
                return Err(e);
            }
        };
        self.stage(GuardStage::Verified, Some(&principal.id));
        *user_id = Some(principal.id.clone());

        self.stage(GuardStage::LoadingContext, Some(&principal.id));
        let context = match self.core.contexts.load_context(&principal.id).await {
            Ok(context) => context,
            Err(e) => {
                self.stage(GuardStage::ContextFailed, Some(&principal.id));
                return Err(e);
            }
        };
        self.stage(GuardStage::ContextLoaded, Some(&principal.id));

        if let Some(requirement) = &self.requirement {
            self.stage(GuardStage::EvaluatingPermissions, Some(&principal.id));
            if !self.evaluate(&context, requirement).await? {
                self.stage(GuardStage::Denied, Some(&principal.id));
                return Err(GuardError::Security {
                    user_id: principal.id,
                    required: requirement.spec.to_string(),
                });
            }
            self.stage(GuardStage::Allowed, Some(&principal.id));
        }

        Ok(AuthorizedRequest { principal, context })
    }

    async fn evaluate(&self, context: &PermissionSnapshot, requirement: &Requirement) -> Result<bool> {
        if !self.core.checks.is_enabled() {
            return Ok(resolver::evaluate(context, &requirement.spec));
        }

        let key = check_key(context, &requirement.fingerprint);
        let (allowed, computed) = self
            .core
            .checks
            .get_or_load_traced(&key, self.core.check_ttl, || async {
                Ok(resolver::evaluate(context, &requirement.spec))
            })
            .await?;

        if computed {
            self.core.metrics.record_cache_miss();
        } else {
            self.core.metrics.record_cache_hit();
        }

        Ok(allowed)
    }

    async fn finish(&self, outcome: &Result<AuthorizedRequest>, user_id: Option<UserId>, started: Instant) {
        let elapsed = started.elapsed();
        let system_failure = outcome
            .as_ref()
            .err()
            .map_or(false, GuardError::is_system_failure);
        self.core.metrics.record_check(outcome.is_ok(), system_failure);
        if self.core.performance_tracking {
            self.core.metrics.record_latency(elapsed).await;
        }

        if let Err(error) = outcome {
            match error {
                GuardError::Authentication(failure) => {
                    debug!(failure = %failure, "Request unauthenticated")
                }
                _ => warn!(
                    user_id = user_id.as_deref().unwrap_or("-"),
                    denial = ?error.denial(),
                    %error,
                    "Request denied"
                ),
            }

            if let Some(audit) = &self.core.audit {
                audit
                    .record(AuditEvent::denied(user_id.clone(), error.denial(), error.to_string()))
                    .await;
            }
        }

        self.stage(GuardStage::End, user_id.as_deref());
        if self.core.detailed_logging {
            debug!(elapsed_us = elapsed.as_micros() as u64, allowed = outcome.is_ok(), "Guard finished");
        }
    }

    fn stage(&self, stage: GuardStage, user_id: Option<&str>) {
        if self.core.detailed_logging {
            debug!(stage = ?stage, user_id = user_id.unwrap_or("-"), "Guard stage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_check_key_scoped_to_user_and_snapshot() {
        let now = Utc::now();
        let first = PermissionSnapshot::on_demand("alice", Default::default(), 1, now);
        let second = PermissionSnapshot::on_demand("alice", Default::default(), 2, now);
        let other = PermissionSnapshot::on_demand("alicia", Default::default(), 1, now);

        let key = check_key(&first, "fp");
        assert!(key.starts_with(&user_check_prefix("alice")));
        assert!(!check_key(&other, "fp").starts_with(&user_check_prefix("alice")));
        assert_ne!(key, check_key(&second, "fp"));
        assert!(key.ends_with("fp"));
    }
}
