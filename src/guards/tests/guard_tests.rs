//! End-to-end guard pipeline tests

use hyper::header::{HeaderMap, HeaderValue};
use routeguards::{
    AuthFailure, AuthHeaderConfig, DenialReason, FnVerifier, GuardError, GuardProfile,
    InMemoryPermissionSource, ManualClock, MemoryAuditSink, PermissionExpression, Principal,
    ResolutionStrategy, RouteGuards, UserPermissions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// FIXTURES
// ============================================================================

struct Harness {
    guards: Arc<RouteGuards>,
    source: Arc<InMemoryPermissionSource>,
    audit: MemoryAuditSink,
    clock: Arc<ManualClock>,
    verifications: Arc<AtomicUsize>,
}

/// Tokens look like `token-<user>`; anything else is rejected
async fn harness_with(profile: GuardProfile, source: InMemoryPermissionSource) -> Harness {
    let source = Arc::new(source);
    source.put_user("reader", UserPermissions::new(["user:read"])).await;
    source
        .put_user("admin", UserPermissions::new(["admin.users.create"]).with_roles(["admin"]))
        .await;
    source.put_user("a-only", UserPermissions::new(["a"])).await;
    source.put_user("a-and-b", UserPermissions::new(["a", "b"])).await;
    source
        .put_user("super", UserPermissions::new(["admin.*"]).with_roles(["admin"]))
        .await;

    let verifications = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&verifications);
    let verifier = FnVerifier::new(move |token: String| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            match token.strip_prefix("token-") {
                Some(user) if !user.is_empty() => Ok(Principal::new(user)),
                _ => Err(GuardError::auth(AuthFailure::InvalidCredential)),
            }
        }
    });

    let clock = Arc::new(ManualClock::default());
    let audit = MemoryAuditSink::new();
    let guards = RouteGuards::builder(profile, Arc::new(verifier), source.clone())
        .clock(clock.clone())
        .audit_sink(Arc::new(audit.clone()))
        .build()
        .unwrap();

    Harness {
        guards: Arc::new(guards),
        source,
        audit,
        clock,
        verifications,
    }
}

async fn harness() -> Harness {
    let mut profile = GuardProfile::testing();
    profile.monitoring.audit = true;
    harness_with(profile, InMemoryPermissionSource::new()).await
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    headers
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_plain_permission_scenarios() {
    let h = harness().await;

    let any_of = h.guards.require_permissions(["user:read", "admin:users"]).unwrap();
    let authorized = any_of.check(&bearer("token-reader")).await.unwrap();
    assert_eq!(authorized.principal.id, "reader");
    assert!(authorized.context.holds("user:read"));

    let admin_only = h.guards.require_permissions(["admin:users"]).unwrap();
    let err = admin_only.check(&bearer("token-reader")).await.unwrap_err();
    assert!(matches!(err, GuardError::Security { ref user_id, .. } if user_id == "reader"));
    assert_eq!(err.denial(), DenialReason::Forbidden);
}

#[tokio::test]
async fn test_wildcard_scenario() {
    let h = harness().await;
    let guard = h.guards.require_wildcard_permissions(["admin.*"]).unwrap();

    assert!(guard.check(&bearer("token-admin")).await.is_ok());
    assert!(guard.check(&bearer("token-reader")).await.is_err());
}

#[tokio::test]
async fn test_expression_scenarios() {
    let h = harness().await;
    let guard = h
        .guards
        .require_complex_permissions(PermissionExpression::and(vec![
            PermissionExpression::leaf("a"),
            PermissionExpression::not(PermissionExpression::leaf("b")),
        ]))
        .unwrap();

    assert!(guard.check(&bearer("token-a-only")).await.is_ok());
    assert!(matches!(
        guard.check(&bearer("token-a-and-b")).await,
        Err(GuardError::Security { .. })
    ));
}

#[tokio::test]
async fn test_expression_too_deep_rejected_at_construction() {
    let h = harness().await;
    assert_eq!(h.guards.profile().limits.max_nesting_depth, 3);

    let deep = PermissionExpression::not(PermissionExpression::not(PermissionExpression::not(
        PermissionExpression::leaf("a"),
    )));
    assert!(matches!(
        h.guards.require_complex_permissions(deep),
        Err(GuardError::Validation(_))
    ));
    assert_eq!(h.source.load_count(), 0);
}

#[tokio::test]
async fn test_both_strategies_agree_on_grants() {
    for strategy in [ResolutionStrategy::PreExpansion, ResolutionStrategy::OnDemand] {
        let profile = GuardProfile::testing().with_strategy(strategy);
        let h = harness_with(profile, InMemoryPermissionSource::new()).await;

        let create = h.guards.require_permissions(["admin.users.create"]).unwrap();
        let billing = h.guards.require_wildcard_permissions(["admin.billing.*"]).unwrap();
        let reader = h.guards.require_permissions(["user:read"]).unwrap();

        assert!(create.check(&bearer("token-super")).await.is_ok(), "{:?}", strategy);
        assert!(billing.check(&bearer("token-super")).await.is_ok(), "{:?}", strategy);
        assert!(reader.check(&bearer("token-super")).await.is_err(), "{:?}", strategy);
    }
}

// ============================================================================
// AUTHENTICATION
// ============================================================================

#[tokio::test]
async fn test_require_auth_attaches_principal_and_context() {
    let h = harness().await;
    let guard = h.guards.require_auth();
    assert!(guard.requirement().is_none());

    let authorized = guard.check(&bearer("token-admin")).await.unwrap();
    assert_eq!(authorized.principal.id, "admin");
    assert!(authorized.context.has_role("admin"));
}

#[tokio::test]
async fn test_authentication_failures() {
    let h = harness().await;
    let guard = h.guards.require_auth();

    let missing = guard.check(&HeaderMap::new()).await.unwrap_err();
    assert!(matches!(
        missing,
        GuardError::Authentication(AuthFailure::MissingCredential)
    ));

    let mut basic = HeaderMap::new();
    basic.insert("authorization", HeaderValue::from_static("Basic abc"));
    assert!(matches!(
        guard.check(&basic).await,
        Err(GuardError::Authentication(AuthFailure::MalformedCredential))
    ));

    assert!(matches!(
        guard.check(&bearer("forged")).await,
        Err(GuardError::Authentication(AuthFailure::InvalidCredential))
    ));

    assert!(matches!(
        guard.check(&bearer("token-nobody")).await,
        Err(GuardError::Authentication(AuthFailure::UnknownUser))
    ));

    // Nothing reached the source for malformed or rejected credentials
    assert_eq!(h.source.load_count(), 1);
    assert_eq!(h.audit.len().await, 4);
}

#[tokio::test]
async fn test_custom_api_key_header() {
    let source = Arc::new(InMemoryPermissionSource::new());
    source.put_user("svc", UserPermissions::new(["jobs.run"])).await;

    let verifier = FnVerifier::new(|key: String| async move {
        if key == "k-123" {
            Ok(Principal::new("svc"))
        } else {
            Err(GuardError::auth(AuthFailure::InvalidCredential))
        }
    });
    let guards = RouteGuards::builder(GuardProfile::testing(), Arc::new(verifier), source)
        .auth_header(AuthHeaderConfig::api_key("x-api-key"))
        .build()
        .unwrap();
    let guard = guards.require_permissions(["jobs.run"]).unwrap();

    let mut request = HashMap::new();
    request.insert("X-Api-Key".to_string(), "k-123".to_string());
    assert!(guard.check(&request).await.is_ok());

    let request = hyper::Request::builder()
        .header("x-api-key", "k-123")
        .body(())
        .unwrap();
    assert!(guard.check(&request).await.is_ok());
}

#[tokio::test]
async fn test_blocked_token_beats_cached_success() {
    let h = harness().await;
    let guard = h.guards.require_auth();

    guard.check(&bearer("token-reader")).await.unwrap();
    h.guards.block_token("token-reader").await;

    let err = guard.check(&bearer("token-reader")).await.unwrap_err();
    assert!(matches!(
        err,
        GuardError::Authentication(AuthFailure::BlockedCredential)
    ));
    assert_eq!(err.denial(), DenialReason::Unauthenticated);

    assert!(h.guards.unblock_token("token-reader"));
    assert!(guard.check(&bearer("token-reader")).await.is_ok());
}

// ============================================================================
// CACHING
// ============================================================================

#[tokio::test]
async fn test_repeat_checks_hit_caches() {
    let h = harness().await;
    let guard = h.guards.require_permissions(["user:read"]).unwrap();

    for _ in 0..5 {
        guard.check(&bearer("token-reader")).await.unwrap();
    }

    assert_eq!(h.verifications.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.load_count(), 1);

    let stats = h.guards.get_stats().await;
    assert_eq!(stats.total_checks, 5);
    assert_eq!(stats.allowed, 5);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 4);
}

#[tokio::test]
async fn test_ttl_expiry_forces_reload() {
    let h = harness().await;
    let guard = h.guards.require_permissions(["user:read"]).unwrap();

    guard.check(&bearer("token-reader")).await.unwrap();
    h.clock.advance_ms(999);
    guard.check(&bearer("token-reader")).await.unwrap();
    assert_eq!(h.source.load_count(), 1);

    h.clock.advance_ms(1);
    guard.check(&bearer("token-reader")).await.unwrap();
    assert_eq!(h.source.load_count(), 2);
    assert_eq!(h.verifications.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_caching_disabled_always_reloads() {
    let profile = GuardProfile::testing().with_cache_enabled(false);
    let h = harness_with(profile, InMemoryPermissionSource::new()).await;
    let guard = h.guards.require_permissions(["user:read"]).unwrap();

    for _ in 0..3 {
        guard.check(&bearer("token-reader")).await.unwrap();
    }
    assert_eq!(h.source.load_count(), 3);
    assert_eq!(h.verifications.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_load_once() {
    let h = harness_with(
        GuardProfile::testing(),
        InMemoryPermissionSource::new().with_latency(Duration::from_millis(50)),
    )
    .await;
    let guard = h.guards.require_permissions(["user:read"]).unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let guard = guard.clone();
        handles.push(tokio::spawn(async move {
            guard.check(&bearer("token-reader")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(h.source.load_count(), 1);
    assert_eq!(h.verifications.load(Ordering::SeqCst), 1);
}

// ============================================================================
// FAILURES, CANCELLATION, TIMEOUTS
// ============================================================================

#[tokio::test]
async fn test_source_failure_fails_closed() {
    let h = harness().await;
    h.source.set_failing(true);
    let guard = h.guards.require_auth();

    let err = guard.check(&bearer("token-reader")).await.unwrap_err();
    assert!(matches!(err, GuardError::Source(_)));
    assert_eq!(err.denial(), DenialReason::Unavailable);

    let stats = h.guards.get_stats().await;
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.denied, 1);
}

#[tokio::test]
async fn test_source_failure_detail_stays_internal() {
    let h = harness().await;
    h.source.set_failing(true);
    let guard = h.guards.require_auth();

    let err = guard.check(&bearer("token-reader")).await.unwrap_err();
    assert!(matches!(err, GuardError::Source(_)));
    assert!(!err.to_string().contains("permission store unavailable"));

    // The audit trail keeps the upstream message
    let denials = h.audit.denials_for("reader").await;
    assert_eq!(denials.len(), 1);
    assert!(denials[0].reason.contains("permission store unavailable"));
}

#[tokio::test]
async fn test_cancellation_fails_closed_with_timeout() {
    let h = harness_with(
        GuardProfile::testing(),
        InMemoryPermissionSource::new().with_latency(Duration::from_secs(30)),
    )
    .await;
    let guard = h.guards.require_auth();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = guard
        .check_with_cancel(&bearer("token-reader"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Timeout));
    assert_eq!(err.denial(), DenialReason::Timeout);
}

#[tokio::test]
async fn test_request_timeout_from_profile() {
    let profile = GuardProfile::testing().with_request_timeout(Duration::from_millis(20));
    let h = harness_with(
        profile,
        InMemoryPermissionSource::new().with_latency(Duration::from_secs(30)),
    )
    .await;

    let result = h.guards.require_auth().check(&bearer("token-reader")).await;
    assert!(matches!(result, Err(GuardError::Timeout)));
    assert_eq!(h.guards.get_stats().await.errors, 1);
}

// ============================================================================
// OPERATIONAL SURFACE
// ============================================================================

#[tokio::test]
async fn test_denials_are_audited() {
    let h = harness().await;
    let guard = h.guards.require_permissions(["admin:users"]).unwrap();
    let _ = guard.check(&bearer("token-reader")).await;

    let denials = h.audit.denials_for("reader").await;
    assert_eq!(denials.len(), 1);
    assert!(denials[0].reason.contains("admin:users"));
}

#[tokio::test]
async fn test_health_and_system_stats() {
    let h = harness().await;
    let guard = h.guards.require_permissions(["user:read"]).unwrap();
    guard.check(&bearer("token-reader")).await.unwrap();
    guard.check(&bearer("token-reader")).await.unwrap();

    let stats = h.guards.get_system_stats().await;
    assert_eq!(stats.metrics.total_checks, 2);
    assert!(stats.registry_size >= 1);
    assert!(stats.cache_hit_rate() > 0.0);

    let health = h.guards.health_check().await;
    assert_eq!(health.error_rate, 0.0);
    assert_eq!(health.details.get("total_checks").map(String::as_str), Some("2"));

    let text = h.guards.export_prometheus().await;
    assert!(text.contains("routeguards_checks_total 2"));
}
