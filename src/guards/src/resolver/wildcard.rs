//! Hierarchical wildcard matching
//!
//! Permissions are dot-separated paths. A pattern `x.*` matches `x` itself
//! and everything beneath it, segment-exact and case-sensitive:
//! `admin.*` matches `admin`, `admin.users` and `admin.users.create` but not
//! `administration.x`.
//!
//! A held permission ending in `.*` is a grant covering the same set.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{validate_permission, Resolver};
use crate::error::{GuardError, Result};
use crate::types::PermissionSnapshot;

const WILDCARD_SUFFIX: &str = ".*";

/// Validated wildcard pattern (`base.*`) or concrete permission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WildcardPattern {
    raw: String,
    base_len: Option<usize>,
}

impl WildcardPattern {
    /// Parses `base.*` or a concrete permission.
    ///
    /// The base must be a valid permission: non-empty segments, no `*`.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        match raw.strip_suffix(WILDCARD_SUFFIX) {
            Some(base) => {
                validate_permission(base).map_err(|_| {
                    GuardError::Validation(format!("invalid wildcard pattern '{}'", raw))
                })?;
                let base_len = base.len();
                Ok(Self {
                    raw,
                    base_len: Some(base_len),
                })
            }
            None => {
                validate_permission(&raw)?;
                Ok(Self {
                    raw,
                    base_len: None,
                })
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The path the pattern is rooted at
    pub fn base(&self) -> &str {
        match self.base_len {
            Some(len) => &self.raw[..len],
            None => &self.raw,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.base_len.is_some()
    }

    /// Does this pattern match the given permission?
    pub fn matches(&self, permission: &str) -> bool {
        if self.is_wildcard() {
            is_at_or_under(permission, self.base())
        } else {
            self.raw == permission
        }
    }

    /// Satisfied by a snapshot under either resolution strategy
    pub fn satisfied_by(&self, snapshot: &PermissionSnapshot) -> bool {
        if self.is_wildcard() {
            snapshot.has_match_under(self.base())
        } else {
            snapshot.holds(&self.raw)
        }
    }
}

impl TryFrom<String> for WildcardPattern {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<WildcardPattern> for String {
    fn from(pattern: WildcardPattern) -> Self {
        pattern.raw
    }
}

impl fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Ordered set of patterns; any one suffices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<WildcardPattern>", into = "Vec<WildcardPattern>")]
pub struct WildcardSpec {
    patterns: Vec<WildcardPattern>,
}

impl WildcardSpec {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns
            .into_iter()
            .map(WildcardPattern::new)
            .collect::<Result<Vec<_>>>()?;
        Self::from_patterns(patterns)
    }

    fn from_patterns(patterns: Vec<WildcardPattern>) -> Result<Self> {
        let mut ordered: Vec<WildcardPattern> = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if !ordered.contains(&pattern) {
                ordered.push(pattern);
            }
        }

        if ordered.is_empty() {
            return Err(GuardError::Validation(
                "wildcard spec requires at least one pattern".to_string(),
            ));
        }

        Ok(Self { patterns: ordered })
    }

    pub fn patterns(&self) -> &[WildcardPattern] {
        &self.patterns
    }
}

impl TryFrom<Vec<WildcardPattern>> for WildcardSpec {
    type Error = GuardError;

    fn try_from(value: Vec<WildcardPattern>) -> Result<Self> {
        Self::from_patterns(value)
    }
}

impl From<WildcardSpec> for Vec<WildcardPattern> {
    fn from(spec: WildcardSpec) -> Self {
        spec.patterns
    }
}

/// `true` iff some held permission matches some required pattern.
///
/// Pre-expanded snapshots answer each pattern with one set lookup;
/// on-demand snapshots scan their raw patterns.
#[derive(Debug, Default, Clone, Copy)]
pub struct WildcardResolver;

impl Resolver for WildcardResolver {
    type Spec = WildcardSpec;

    fn evaluate(&self, snapshot: &PermissionSnapshot, spec: &WildcardSpec) -> bool {
        spec.patterns.iter().any(|p| p.satisfied_by(snapshot))
    }
}

/// Free-standing match on raw strings: `pattern` may be `base.*` or exact
pub fn matches(pattern: &str, permission: &str) -> bool {
    match pattern.strip_suffix(WILDCARD_SUFFIX) {
        Some(base) if !base.is_empty() => is_at_or_under(permission, base),
        _ => pattern == permission,
    }
}

/// `path == base` or `path` starts with `base.`
pub fn is_at_or_under(path: &str, base: &str) -> bool {
    path.len() >= base.len()
        && path.starts_with(base)
        && (path.len() == base.len() || path.as_bytes()[base.len()] == b'.')
}

/// The base of a held grant (`x.*` → `x`), or `None` for concrete permissions
pub fn grant_base(permission: &str) -> Option<&str> {
    permission
        .strip_suffix(WILDCARD_SUFFIX)
        .filter(|base| !base.is_empty())
}

/// Every wildcard pattern that matches `permission`.
///
/// `a.b.c` → `a.*`, `a.b.*`, `a.b.c.*`. Membership in this set is exactly
/// [`matches`] for patterns with a non-empty base.
pub fn ancestor_patterns(permission: &str) -> impl Iterator<Item = String> + '_ {
    permission
        .match_indices('.')
        .map(|(idx, _)| idx)
        .chain(std::iter::once(permission.len()))
        .filter(|idx| *idx > 0)
        .map(move |idx| format!("{}{}", &permission[..idx], WILDCARD_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchical_prefix_rule() {
        assert!(matches("admin.*", "admin"));
        assert!(matches("admin.*", "admin.users"));
        assert!(matches("admin.*", "admin.users.create"));
        assert!(!matches("admin.*", "administration"));
        assert!(!matches("admin.*", "administration.x"));
        assert!(!matches("admin.*", "Admin.users"));
        assert!(!matches("admin.users.*", "admin"));
    }

    #[test]
    fn test_exact_pattern() {
        assert!(matches("admin.users", "admin.users"));
        assert!(!matches("admin.users", "admin.users.create"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(WildcardPattern::new("admin.*").is_ok());
        assert!(WildcardPattern::new("admin.users").is_ok());
        assert!(WildcardPattern::new("*").is_err());
        assert!(WildcardPattern::new(".*").is_err());
        assert!(WildcardPattern::new("admin.*.users").is_err());
        assert!(WildcardPattern::new("adm*").is_err());
        assert!(WildcardPattern::new("").is_err());
    }

    #[test]
    fn test_pattern_base() {
        let pattern = WildcardPattern::new("admin.users.*").unwrap();
        assert!(pattern.is_wildcard());
        assert_eq!(pattern.base(), "admin.users");
        assert!(pattern.matches("admin.users"));
        assert!(!pattern.matches("admin"));

        let exact = WildcardPattern::new("admin.users").unwrap();
        assert!(!exact.is_wildcard());
        assert_eq!(exact.base(), "admin.users");
    }

    #[test]
    fn test_grant_base() {
        assert_eq!(grant_base("admin.*"), Some("admin"));
        assert_eq!(grant_base("admin"), None);
        assert_eq!(grant_base(".*"), None);
        assert_eq!(grant_base("*"), None);
    }

    #[test]
    fn test_ancestor_patterns() {
        let patterns: Vec<String> = ancestor_patterns("a.b.c").collect();
        assert_eq!(patterns, vec!["a.*", "a.b.*", "a.b.c.*"]);

        for pattern in &patterns {
            assert!(matches(pattern, "a.b.c"));
        }
    }

    #[test]
    fn test_resolver_scenario() {
        use crate::types::UserPermissions;

        let snapshot = PermissionSnapshot::on_demand(
            "alice",
            UserPermissions::new(["admin.users.create"]),
            1,
            chrono::Utc::now(),
        );
        let spec = WildcardSpec::new(["admin.*"]).unwrap();
        assert!(WildcardResolver.evaluate(&snapshot, &spec));

        let spec = WildcardSpec::new(["billing.*", "admin.roles.*"]).unwrap();
        assert!(!WildcardResolver.evaluate(&snapshot, &spec));
    }

    #[test]
    fn test_serde_validates() {
        let ok: std::result::Result<WildcardPattern, _> = serde_json::from_str("\"admin.*\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<WildcardPattern, _> = serde_json::from_str("\"adm*\"");
        assert!(bad.is_err());
    }
}
