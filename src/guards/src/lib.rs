//! # RouteGuards
//!
//! Permission resolution and caching guard engine for request
//! authorization.
//!
//! ## Features
//!
//! - **Token verification** through a caller-supplied verifier, cached by
//!   credential fingerprint, with revocation
//! - **Permission snapshots** loaded from an external source, resolved by
//!   pre-expansion or on-demand matching
//! - **Three resolvers**: plain permissions, hierarchical wildcards and
//!   bounded boolean expressions
//! - **Layered TTL caching** with single-flight population and an optional
//!   shared second tier
//! - **Conservative invalidation** per user, per role or system-wide
//! - **Metrics, health and audit** out of the box
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use routeguards::{
//!     FnVerifier, GuardProfile, InMemoryPermissionSource, Principal, RouteGuards,
//!     UserPermissions,
//! };
//!
//! # tokio_test::block_on(async {
//! let source = Arc::new(InMemoryPermissionSource::new());
//! source.put_user("alice", UserPermissions::new(["admin.users.create"])).await;
//!
//! let verifier = FnVerifier::new(|token: String| async move {
//!     Ok::<_, routeguards::GuardError>(Principal::new(token.trim_start_matches("token-")))
//! });
//!
//! let guards = RouteGuards::new(GuardProfile::testing(), Arc::new(verifier), source).unwrap();
//! let admin_only = guards.require_wildcard_permissions(["admin.*"]).unwrap();
//!
//! let authorized = admin_only.check_credential("token-alice").await.unwrap();
//! assert_eq!(authorized.principal.id, "alice");
//! # });
//! ```

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod guard;
pub mod invalidation;
pub mod metrics;
pub mod resolver;
pub mod telemetry;
pub mod token;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditKind, AuditSink, InvalidationScope, MemoryAuditSink, TracingAuditSink};
pub use cache::{CacheStats, InMemorySharedTier, LayeredCache, SharedCacheTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AuthHeaderConfig, CacheSettings, CacheTtls, ComplexityLimits, Environment, GuardProfile,
    InvalidationMode, MonitoringFlags, ResolutionStrategy,
};
pub use context::{InMemoryPermissionSource, PermissionRegistry, PermissionSource, UserContextService};
pub use error::{AuthFailure, CacheDegradedError, DenialReason, GuardError, Result};
pub use facade::{RouteGuards, RouteGuardsBuilder};
pub use guard::{AuthenticationGuard, AuthorizedRequest, GuardRequest, GuardStage};
pub use invalidation::{InvalidationCoordinator, InvalidationReport};
pub use metrics::{GuardMetrics, HealthReport, HealthStatus, SystemStats};
pub use resolver::{PermissionExpression, PermissionSpec, ResolverKind};
pub use telemetry::init_tracing;
pub use token::{CredentialExtractor, FnVerifier, TokenVerifier, TokenVerifierAdapter};
pub use types::{PermissionSnapshot, Principal, UserId, UserPermissions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
