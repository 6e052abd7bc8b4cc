//! Permission resolvers
//!
//! Three pure strategies decide whether a snapshot satisfies a requirement:
//!
//! - **Plain**: OR over exact permissions
//! - **Wildcard**: OR over hierarchical `base.*` patterns
//! - **Expression**: bounded AND / OR / NOT trees
//!
//! [`PermissionSpec`] is the closed set of requirements; [`evaluate`] is the
//! single dispatch point.
//!
//! # Example
//!
//! ```rust
//! use routeguards::resolver::{evaluate, PermissionSpec};
//! use routeguards::types::{PermissionSnapshot, UserPermissions};
//!
//! let snapshot = PermissionSnapshot::on_demand(
//!     "alice",
//!     UserPermissions::new(["admin.users.create"]),
//!     1,
//!     chrono::Utc::now(),
//! );
//! let spec = PermissionSpec::wildcard(["admin.*"]).unwrap();
//! assert!(evaluate(&snapshot, &spec));
//! ```

pub mod expression;
pub mod plain;
pub mod wildcard;

pub use expression::{ExpressionResolver, ExpressionSpec, PermissionExpression};
pub use plain::{PlainResolver, PlainSpec};
pub use wildcard::{WildcardPattern, WildcardResolver, WildcardSpec};

use serde::Serialize;
use std::fmt;

use crate::config::ComplexityLimits;
use crate::error::{GuardError, Result};
use crate::types::PermissionSnapshot;

/// A pure permission strategy
pub trait Resolver {
    type Spec;

    /// No I/O, no mutation
    fn evaluate(&self, snapshot: &PermissionSnapshot, spec: &Self::Spec) -> bool;
}

/// Which resolver a spec dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    Plain,
    Wildcard,
    Expression,
}

/// A validated permission requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum PermissionSpec {
    Plain(PlainSpec),
    Wildcard(WildcardSpec),
    Expression(ExpressionSpec),
}

impl PermissionSpec {
    pub fn plain<I, S>(permissions: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PlainSpec::new(permissions).map(Self::Plain)
    }

    pub fn wildcard<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WildcardSpec::new(patterns).map(Self::Wildcard)
    }

    pub fn expression(expression: PermissionExpression, limits: &ComplexityLimits) -> Result<Self> {
        ExpressionSpec::new(expression, limits).map(Self::Expression)
    }

    pub fn kind(&self) -> ResolverKind {
        match self {
            Self::Plain(_) => ResolverKind::Plain,
            Self::Wildcard(_) => ResolverKind::Wildcard,
            Self::Expression(_) => ResolverKind::Expression,
        }
    }

    /// Concrete permissions the spec can ask about.
    ///
    /// Registering these lets pre-expansion produce the same outcome as
    /// on-demand matching.
    pub fn referenced_permissions(&self) -> Vec<&str> {
        match self {
            Self::Plain(spec) => spec.permissions().iter().map(String::as_str).collect(),
            Self::Wildcard(spec) => spec.patterns().iter().map(WildcardPattern::base).collect(),
            Self::Expression(spec) => spec.expression().leaves(),
        }
    }

    /// Stable hex digest identifying the requirement
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => {
                hasher.update(&bytes);
            }
            Err(_) => {
                hasher.update(self.to_string().as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Display for PermissionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(spec) => write!(f, "any of [{}]", spec.permissions().join(", ")),
            Self::Wildcard(spec) => {
                let patterns: Vec<&str> = spec.patterns().iter().map(WildcardPattern::as_str).collect();
                write!(f, "any of [{}]", patterns.join(", "))
            }
            Self::Expression(spec) => write!(f, "{}", spec.expression()),
        }
    }
}

/// Dispatches to the resolver the spec was built for
pub fn evaluate(snapshot: &PermissionSnapshot, spec: &PermissionSpec) -> bool {
    match spec {
        PermissionSpec::Plain(s) => PlainResolver.evaluate(snapshot, s),
        PermissionSpec::Wildcard(s) => WildcardResolver.evaluate(snapshot, s),
        PermissionSpec::Expression(s) => ExpressionResolver.evaluate(snapshot, s),
    }
}

/// A concrete permission: non-empty dot-separated segments, none containing `*`
pub fn validate_permission(permission: &str) -> Result<()> {
    if permission.is_empty() {
        return Err(GuardError::Validation("permission cannot be empty".to_string()));
    }

    for segment in permission.split('.') {
        if segment.is_empty() {
            return Err(GuardError::Validation(format!(
                "permission '{}' has an empty segment",
                permission
            )));
        }
        if segment.contains('*') {
            return Err(GuardError::Validation(format!(
                "wildcards are not allowed in '{}'",
                permission
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_permission() {
        assert!(validate_permission("user:read").is_ok());
        assert!(validate_permission("admin.users.create").is_ok());
        assert!(validate_permission("admin..users").is_err());
        assert!(validate_permission(".admin").is_err());
        assert!(validate_permission("admin.*").is_err());
        assert!(validate_permission("").is_err());
    }

    #[test]
    fn test_fingerprint_distinguishes_kind() {
        let plain = PermissionSpec::plain(["admin"]).unwrap();
        let wildcard = PermissionSpec::wildcard(["admin"]).unwrap();
        assert_ne!(plain.fingerprint(), wildcard.fingerprint());
        assert_eq!(plain.fingerprint(), PermissionSpec::plain(["admin"]).unwrap().fingerprint());
        assert_eq!(plain.fingerprint().len(), 64);
    }

    #[test]
    fn test_referenced_permissions() {
        let spec = PermissionSpec::wildcard(["admin.users.*", "billing.read"]).unwrap();
        assert_eq!(spec.referenced_permissions(), vec!["admin.users", "billing.read"]);

        let spec = PermissionSpec::expression(
            PermissionExpression::and(vec![
                PermissionExpression::leaf("a"),
                PermissionExpression::not(PermissionExpression::leaf("b")),
            ]),
            &ComplexityLimits::default(),
        )
        .unwrap();
        assert_eq!(spec.referenced_permissions(), vec!["a", "b"]);
        assert_eq!(spec.kind(), ResolverKind::Expression);
    }

    #[test]
    fn test_display() {
        let spec = PermissionSpec::plain(["a", "b"]).unwrap();
        assert_eq!(spec.to_string(), "any of [a, b]");
    }
}
