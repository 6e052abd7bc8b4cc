//! Core guard types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::config::ResolutionStrategy;
use crate::resolver::wildcard::{ancestor_patterns, grant_base, is_at_or_under};

/// Unique user identifier
pub type UserId = String;

/// Verified identity produced by the token verifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// User identifier, the key into the permission source
    pub id: UserId,

    /// Verified claims (issuer, scopes, tenant, ...)
    #[serde(default)]
    pub claims: HashMap<String, Value>,

    /// When the credential stops being valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: HashMap::new(),
            expires_at: None,
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| now >= exp)
    }
}

/// Raw permission data as reported by the permission source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPermissions {
    /// Concrete permissions and `x.*` grants
    pub permissions: Vec<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl UserPermissions {
    pub fn new<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: permissions.into_iter().map(Into::into).collect(),
            roles: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A user's permission and role snapshot.
///
/// Replaced wholesale on reload, never mutated in place. Under
/// pre-expansion `permissions` holds only concrete permissions and a
/// wildcard index answers pattern checks by lookup; on demand it holds the
/// raw set, grants included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub user_id: UserId,
    permissions: HashSet<String>,
    pub roles: HashSet<String>,
    pub metadata: HashMap<String, Value>,
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    strategy: ResolutionStrategy,

    /// Bases of held grants (on-demand only)
    #[serde(default)]
    grants: Vec<String>,

    /// Every pattern satisfied by a held permission (pre-expansion only)
    #[serde(default)]
    wildcard_index: HashSet<String>,

    /// Registry generation the expansion was computed against
    #[serde(default)]
    registry_version: u64,
}

impl PermissionSnapshot {
    /// Keeps the raw pattern set; wildcard checks match at evaluation time
    pub fn on_demand(
        user_id: impl Into<String>,
        source: UserPermissions,
        version: u64,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let grants = source
            .permissions
            .iter()
            .filter_map(|p| grant_base(p).map(str::to_string))
            .collect();

        Self {
            user_id: user_id.into(),
            permissions: source.permissions.into_iter().collect(),
            roles: source.roles.into_iter().collect(),
            metadata: source.metadata,
            version,
            loaded_at,
            strategy: ResolutionStrategy::OnDemand,
            grants,
            wildcard_index: HashSet::new(),
            registry_version: 0,
        }
    }

    /// Expands every grant into its base plus the known permissions beneath
    /// it, then indexes every ancestor pattern of the result.
    pub fn pre_expanded(
        user_id: impl Into<String>,
        source: UserPermissions,
        known: &BTreeSet<String>,
        registry_version: u64,
        version: u64,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let mut permissions = HashSet::with_capacity(source.permissions.len());

        for permission in source.permissions {
            match grant_base(&permission) {
                Some(base) => {
                    permissions.insert(base.to_string());
                    permissions.extend(descendants(known, base).cloned());
                }
                None => {
                    permissions.insert(permission);
                }
            }
        }

        let wildcard_index = permissions
            .iter()
            .flat_map(|p| ancestor_patterns(p))
            .collect();

        Self {
            user_id: user_id.into(),
            permissions,
            roles: source.roles.into_iter().collect(),
            metadata: source.metadata,
            version,
            loaded_at,
            strategy: ResolutionStrategy::PreExpansion,
            grants: Vec::new(),
            wildcard_index,
            registry_version,
        }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    pub fn registry_version(&self) -> u64 {
        self.registry_version
    }

    /// Held permissions: concrete only when pre-expanded, raw otherwise
    pub fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Plain membership, honoring held grants
    pub fn holds(&self, permission: &str) -> bool {
        if self.permissions.contains(permission) {
            return true;
        }
        match self.strategy {
            ResolutionStrategy::PreExpansion => false,
            ResolutionStrategy::OnDemand => self
                .grants
                .iter()
                .any(|base| is_at_or_under(permission, base)),
        }
    }

    /// Does any held permission fall at or under `base`?
    pub fn has_match_under(&self, base: &str) -> bool {
        match self.strategy {
            ResolutionStrategy::PreExpansion => {
                self.wildcard_index.contains(&format!("{}.*", base))
            }
            ResolutionStrategy::OnDemand => self.permissions.iter().any(|held| {
                match grant_base(held) {
                    // Overlapping subtrees: either covers the other
                    Some(grant) => is_at_or_under(grant, base) || is_at_or_under(base, grant),
                    None => is_at_or_under(held, base),
                }
            }),
        }
    }
}

/// Known permissions strictly beneath `base`, via a range scan
pub(crate) fn descendants<'a>(
    known: &'a BTreeSet<String>,
    base: &str,
) -> impl Iterator<Item = &'a String> + 'a {
    // '/' sorts immediately after '.'
    let lower = format!("{}.", base);
    let upper = format!("{}/", base);
    known.range(lower..upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(perms: &[&str]) -> BTreeSet<String> {
        perms.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_descendants_range() {
        let known = known(&["admin", "admin.users", "admin.users.create", "administration.x", "adminx"]);
        let found: Vec<&String> = descendants(&known, "admin").collect();
        assert_eq!(found, vec!["admin.users", "admin.users.create"]);
    }

    #[test]
    fn test_pre_expansion_includes_grant_base() {
        let registry = known(&["admin.users.create", "billing.read"]);
        let snapshot = PermissionSnapshot::pre_expanded(
            "alice",
            UserPermissions::new(["admin.*", "user.read"]),
            &registry,
            1,
            1,
            Utc::now(),
        );

        assert!(snapshot.holds("admin"));
        assert!(snapshot.holds("admin.users.create"));
        assert!(snapshot.holds("user.read"));
        assert!(!snapshot.holds("billing.read"));
        assert!(!snapshot.permissions().contains("admin.*"));
        assert!(snapshot.has_match_under("admin.users"));
        assert!(snapshot.has_match_under("user"));
        assert!(!snapshot.has_match_under("billing"));
    }

    #[test]
    fn test_on_demand_grants() {
        let snapshot = PermissionSnapshot::on_demand(
            "alice",
            UserPermissions::new(["admin.*", "user.read"]),
            1,
            Utc::now(),
        );

        assert!(snapshot.holds("admin"));
        assert!(snapshot.holds("admin.anything.at.all"));
        assert!(!snapshot.holds("administration"));
        assert!(snapshot.has_match_under("admin.users"));
        assert!(snapshot.has_match_under("user"));
        assert!(!snapshot.has_match_under("user.read.extra"));
    }

    #[test]
    fn test_principal_expiry() {
        let now = Utc::now();
        let principal = Principal::new("alice").with_expiry(now);
        assert!(principal.is_expired(now));
        assert!(!Principal::new("bob").is_expired(now));
    }
}
